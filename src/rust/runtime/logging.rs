// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. The log specification is taken from `RUST_LOG` and defaults to `info`.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        match Logger::try_with_env_or_str("info").and_then(|logger| logger.start()) {
            // The handle flushes on drop, and logging must outlive every caller.
            Ok(handle) => ::std::mem::forget(handle),
            // Another logger is already installed by the embedding application.
            Err(e) => eprintln!("logging::initialize(): failed to start logger ({:?})", e),
        }
    });
}
