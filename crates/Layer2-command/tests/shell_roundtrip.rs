//! Rendered commands parsed by a real `sh` must give back the original values
//!
//! `cargo test -p xrun-command --test shell_roundtrip`

#![cfg(unix)]

use std::process::Command;
use xrun_command::{CommandBuilder, CommandSpec, Segment, ShellDialect};

fn run_sh(line: &str) -> Vec<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(line)
        .output()
        .expect("sh should be available");
    assert!(output.status.success(), "sh failed for {:?}", line);
    let stdout = String::from_utf8(output.stdout).unwrap();
    let mut args: Vec<String> = stdout.split('\0').map(str::to_string).collect();
    // trailing terminator
    assert_eq!(args.pop().as_deref(), Some(""));
    args
}

#[test]
fn test_metacharacters_round_trip() {
    let values = vec![
        "a b",
        "",
        "it's",
        "\"double\"",
        "$HOME",
        "`id`",
        "a;b",
        "x|y",
        "p&q",
        "<in",
        ">out",
        "back\\slash",
        "multi\nline",
        "*",
        "~",
        "#comment",
        "tab\there",
        "'''",
        "ünïcödé",
    ];

    let spec = CommandBuilder::new("printf")
        .arg("%s\\0")
        .args(values.clone())
        .build()
        .unwrap();
    let line = spec.to_shell_string(ShellDialect::Posix);

    assert_eq!(run_sh(&line), values);
}

#[test]
fn test_list_value_is_distinct_arguments() {
    let files = vec!["one two", "three"];
    let spec = CommandSpec::build([
        Segment::literal("printf '%s\\0' "),
        Segment::value(files.clone()),
    ])
    .unwrap();

    assert_eq!(run_sh(&spec.to_shell_string(ShellDialect::Posix)), files);
}

#[test]
fn test_empty_string_is_an_argument() {
    let spec = CommandSpec::template("printf '%s\\0' {} {}", ["", "after"]).unwrap();
    assert_eq!(
        run_sh(&spec.to_shell_string(ShellDialect::Posix)),
        vec!["".to_string(), "after".to_string()]
    );
}
