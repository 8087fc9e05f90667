// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_limits()?;
    Ok(())
}

/// Fixed capacities of the kernel's tables.
///
/// These can be overridden by setting `KERN_CONFIG` to a RON record, e.g.
/// `(max_grants: 8, callback_queue_depth: 4)`. Fields left out keep their
/// defaults.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KernelLimits {
    max_grants: usize,
    callback_queue_depth: usize,
    max_subscriptions: usize,
    deferred_call_slots: usize,
    trace_depth: usize,
}

impl Default for KernelLimits {
    fn default() -> Self {
        Self {
            max_grants: 16,
            callback_queue_depth: 10,
            max_subscriptions: 16,
            deferred_call_slots: 16,
            trace_depth: 32,
        }
    }
}

fn generate_limits() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_CONFIG");
    let limits: KernelLimits = match env::var("KERN_CONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelLimits::default(),
        Err(e) => return Err(e.into()),
    };

    // Pending deferred calls are tracked in a u32 bitmask.
    if limits.deferred_call_slots > 32 {
        return Err(format!(
            "deferred_call_slots is {}, at most 32 are supported",
            limits.deferred_call_slots
        )
        .into());
    }
    for (name, value) in [
        ("callback_queue_depth", limits.callback_queue_depth),
        ("trace_depth", limits.trace_depth),
    ] {
        if value == 0 {
            return Err(format!("{name} must be nonzero").into());
        }
    }

    let out = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR not set")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "/// Grant types that can be created over the life of the kernel."
    )?;
    writeln!(file, "pub const MAX_GRANTS: usize = {};", limits.max_grants)?;
    writeln!(file, "/// Callbacks that can wait for one process.")?;
    writeln!(
        file,
        "pub const CALLBACK_QUEUE_DEPTH: usize = {};",
        limits.callback_queue_depth
    )?;
    writeln!(file, "/// Callback subscriptions one process can hold.")?;
    writeln!(
        file,
        "pub const MAX_SUBSCRIPTIONS: usize = {};",
        limits.max_subscriptions
    )?;
    writeln!(file, "/// Capsules that can register for deferred calls.")?;
    writeln!(
        file,
        "pub const DEFERRED_CALL_SLOTS: usize = {};",
        limits.deferred_call_slots
    )?;
    writeln!(file, "/// Entries kept in the kernel trace buffer.")?;
    writeln!(file, "pub const TRACE_DEPTH: usize = {};", limits.trace_depth)?;

    Ok(())
}
