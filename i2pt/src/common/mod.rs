// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod accept;
pub mod daemon;
pub mod identity;
pub mod overlay;
pub mod pt;
pub mod sam;
