// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

fn main() {
    // Only rebuild when something other than the gc_tests output tree
    // changes; lets `cargo test` iterate without rediscovering every file.
    rerun_except::rerun_except(&["gc_tests"]).unwrap();

    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap();
    if target_arch == "x86_64" && target_os == "linux" {
        cc::Build::new()
            .file("asm/spill_registers.s")
            .compile("SpillRegisters");
    }
    // Other platform/arch combinations fall back to the stack-only
    // conservative scan in `roots::push_all_eager` (see DESIGN.md).
}
