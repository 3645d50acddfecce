//! bpftrace script generation

use crate::catalog::Function;
use std::fmt::Write;

/// One uprobe/uretprobe pair per function
///
/// Entry lines print `b <vaddr> <tid> <ns>`, exit lines `e <vaddr> <tid> <ns>`.
/// With `callstacks`, each entry is followed by the user stack and a lone
/// `d` line. Returns `None` when there is nothing to trace.
#[must_use]
pub fn generate_script(functions: &[Function], callstacks: bool) -> Option<String> {
    if functions.is_empty() {
        return None;
    }

    let mut script = String::new();
    for function in functions {
        let probe = function.probe();
        let vaddr = function.virtual_address();
        // `write!` into a String cannot fail
        if callstacks {
            let _ = writeln!(
                script,
                r#"   uprobe:{probe}{{ printf("b {vaddr} %u %lld\n%s\n\nd\n\n", tid, nsecs, ustack(perf)); }}"#
            );
        } else {
            let _ = writeln!(script, r#"   uprobe:{probe}{{ printf("b {vaddr} %u %lld\n", tid, nsecs); }}"#);
        }
        let _ = writeln!(script, r#"uretprobe:{probe}{{ printf("e {vaddr} %u %lld\n", tid, nsecs); }}"#);
    }
    Some(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function() -> Function {
        Function::new("render", 0x1100, 0x40).in_module("/usr/bin/game", 0x40_0000, 0x1000)
    }

    #[test]
    fn test_empty_selection_yields_nothing() {
        assert!(generate_script(&[], false).is_none());
    }

    #[test]
    fn test_probe_pair_per_function() {
        let script = generate_script(&[function()], false).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            [
                r#"   uprobe:/usr/bin/game:render{ printf("b 4194560 %u %lld\n", tid, nsecs); }"#,
                r#"uretprobe:/usr/bin/game:render{ printf("e 4194560 %u %lld\n", tid, nsecs); }"#,
            ]
        );
    }

    #[test]
    fn test_callstack_mode_prints_ustack() {
        let script = generate_script(&[function()], true).unwrap();
        assert!(script.contains("ustack(perf)"));
        assert!(script.contains(r"\nd\n"));
        assert_eq!(script.lines().count(), 2);
    }
}
