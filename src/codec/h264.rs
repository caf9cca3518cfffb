// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod marking;
pub mod picture;
pub mod poc;
pub mod rpl;
pub mod syntax;
