// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod when_all;
mod when_any;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    when_all::{
        join_all,
        WhenAll,
    },
    when_any::{
        OneOf2,
        OneOf3,
        OneOf4,
        WhenAny,
    },
};

pub(crate) use self::when_any::race_all;
