// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel diagnostics.
//!
//! `klog!` takes an optional level prefix (`error:`, `warn:`, `info:`,
//! `debug:`) followed by ordinary format arguments:
//!
//! ```ignore
//! klog!(warn: "skipping image at {:#010x}: {}", addr, why);
//! klog!("loaded {} processes", n);
//! ```
//!
//! With the `klog` feature on, messages go to the `log` facade under the
//! `kern` target, and the board decides where they end up. With it off they
//! compile to nothing.

cfg_if::cfg_if! {
    if #[cfg(feature = "klog")] {
        macro_rules! klog {
            (error: $($arg:tt)+) => { log::error!(target: "kern", $($arg)+) };
            (warn: $($arg:tt)+) => { log::warn!(target: "kern", $($arg)+) };
            (info: $($arg:tt)+) => { log::info!(target: "kern", $($arg)+) };
            (debug: $($arg:tt)+) => { log::debug!(target: "kern", $($arg)+) };
            ($($arg:tt)+) => { log::info!(target: "kern", $($arg)+) };
        }
    } else {
        // Arguments are still type-checked so that values only used for
        // logging don't turn into warnings.
        macro_rules! klog {
            (error: $($arg:tt)+) => {{ let _ = format_args!($($arg)+); }};
            (warn: $($arg:tt)+) => {{ let _ = format_args!($($arg)+); }};
            (info: $($arg:tt)+) => {{ let _ = format_args!($($arg)+); }};
            (debug: $($arg:tt)+) => {{ let _ = format_args!($($arg)+); }};
            ($($arg:tt)+) => {{ let _ = format_args!($($arg)+); }};
        }
    }
}
