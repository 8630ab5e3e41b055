// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compiles and runs every `gc_tests/tests/*.rs` scenario against the
//! `gcrt` library built by the surrounding `cargo test`, asserting on
//! process exit status (§8 end-to-end scenarios). Each test file declares
//! its own `// Run-time:` expectations, following `lang_tester`'s usual
//! convention.

use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};

use lang_tester::LangTester;
use tempdir::TempDir;

/// Locates the directory `cargo test` placed `libgcrt-*.rlib` and its
/// dependency `.rlib`s in, so the harness can compile each scenario against
/// exactly the library under test rather than a stale or system copy.
fn deps_dir() -> PathBuf {
    let mut p = env::current_exe().unwrap();
    // The harness binary itself lives at target/<profile>/deps/gc_tests-<hash>;
    // its sibling .rlib artifacts are in that same `deps` directory.
    p.pop();
    p
}

/// `rustc --extern` wants the exact, hash-suffixed rlib filename `cargo`
/// produced; this picks the most recently built `libgcrt-*.rlib` in `dir`
/// rather than hard-coding a hash that changes every build.
fn find_gcrt_rlib(dir: &Path) -> PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("libgcrt-") && n.ends_with(".rlib"))
                .unwrap_or(false)
        })
        .max_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
        .expect("libgcrt-*.rlib not found; run `cargo build` before the gc_tests binary")
}

fn main() {
    let tempdir = TempDir::new("gcrt_lang_tests").unwrap();
    let deps = deps_dir();
    let rlib = find_gcrt_rlib(&deps);

    LangTester::new()
        .test_dir("gc_tests/tests")
        .test_file_filter(|p: &Path| p.extension().map(|e| e == "rs").unwrap_or(false))
        .test_extract(|p| {
            let contents = std::fs::read_to_string(p).unwrap();
            contents
                .lines()
                .take_while(|l| l.starts_with("//"))
                .map(|l| l.trim_start_matches("//"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .test_cmds(move |p: &Path| {
            let mut exe = PathBuf::from(tempdir.path());
            exe.push(p.file_stem().unwrap());

            let mut compiler = Command::new("rustc");
            compiler.args(&[
                "--edition",
                "2018",
                "-o",
                exe.to_str().unwrap(),
                p.to_str().unwrap(),
                "-L",
                deps.to_str().unwrap(),
                "--extern",
                &format!("gcrt={}", rlib.to_str().unwrap()),
            ]);

            let runtime = Command::new(exe);
            vec![("Compiler", compiler), ("Run-time", runtime)]
        })
        .run();
}
