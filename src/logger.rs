// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A built-in logger, enabled by the default-on `builtin_env_logger` feature
//! (§1A "Logging"), so a host binary sees readable `GC_PRINT_STATS`/cycle
//! diagnostics without wiring up its own `log` subscriber. A host that
//! already installs one (or wants a different sink) disables the feature and
//! registers its own implementation with the `log` facade instead.

/// Attempts to install the built-in `env_logger`. A no-op if the feature is
/// disabled, or if some other `log` implementation already claimed the
/// global logger (the only way `env_logger::try_init` can fail).
pub(crate) fn try_init() {
    #[cfg(feature = "builtin_env_logger")]
    {
        let result = env_logger::try_init_from_env(
            env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
        );
        match result {
            Ok(()) => log::debug!("gcrt initialized the built-in env_logger"),
            Err(e) => log::debug!("gcrt failed to initialize the built-in env_logger: {}", e),
        }
    }
    #[cfg(not(feature = "builtin_env_logger"))]
    {
        log::debug!("gcrt didn't initialize the built-in env_logger; builtin_env_logger feature is disabled");
    }
}
