//! Policy Enforcer: a lexical pre-screen of submitted source.
//!
//! This is a cheap filter in front of the sandbox, not the isolation boundary.
//! It over-blocks (a denied name inside a string or comment still matches) and
//! it under-blocks (aliasing and indirect access are invisible to it). The
//! engines in `engine` and `docker` apply the real limits.

use codedrill_common::types::PolicyVerdict;
use regex::Regex;

pub const BLOCKED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "sys",
    "shutil",
    "pathlib",
    "socket",
    "http",
    "urllib",
    "requests",
    "httpx",
    "ctypes",
    "importlib",
    "signal",
    "threading",
    "multiprocessing",
    "asyncio",
    "concurrent",
    "inspect",
    "builtins",
    "pty",
    "posix",
    "_posixsubprocess",
    "io",
    "_io",
    "_thread",
    "gc",
];

pub const BLOCKED_BUILTINS: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "__import__",
    "open",
    "breakpoint",
    "exit",
    "quit",
    "globals",
    "vars",
];

pub const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__self__",
];

#[derive(Debug)]
struct Rule {
    label: String,
    pattern: Regex,
}

#[derive(Debug)]
pub struct Policy {
    rules: Vec<Rule>,
    max_source_bytes: usize,
}

fn module_pattern(module: &str) -> Result<Regex, regex::Error> {
    let m = regex::escape(module);
    Regex::new(&format!(
        r"\b(?:from\s+{m}|import\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*{m})\b"
    ))
}

fn builtin_pattern(name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"(?m)(?:^|[^\w.]){}\s*\(", regex::escape(name)))
}

fn blocked_reason(label: &str) -> String {
    format!(
        "Blocked capability detected: '{}' is not allowed for security reasons.",
        label
    )
}

impl Policy {
    pub fn new(extra_modules: &[String], max_source_bytes: usize) -> Result<Self, regex::Error> {
        let mut rules = Vec::new();

        let modules = BLOCKED_MODULES
            .iter()
            .map(|m| m.to_string())
            .chain(extra_modules.iter().map(|m| m.trim().to_string()))
            .filter(|m| !m.is_empty());
        for module in modules {
            rules.push(Rule {
                pattern: module_pattern(&module)?,
                label: module,
            });
        }

        for name in BLOCKED_BUILTINS {
            rules.push(Rule {
                label: format!("{}()", name),
                pattern: builtin_pattern(name)?,
            });
        }

        for attr in BLOCKED_ATTRIBUTES {
            rules.push(Rule {
                label: attr.to_string(),
                pattern: Regex::new(&regex::escape(attr))?,
            });
        }

        Ok(Self {
            rules,
            max_source_bytes,
        })
    }

    /// Pure function of the source text; the first matching rule wins.
    pub fn check(&self, source: &str) -> PolicyVerdict {
        if source.len() > self.max_source_bytes {
            return PolicyVerdict::blocked(format!(
                "Submission exceeds maximum size of {} bytes",
                self.max_source_bytes
            ));
        }

        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(source))
            .map(|rule| PolicyVerdict::blocked(blocked_reason(&rule.label)))
            .unwrap_or_else(PolicyVerdict::allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy::new(&[], 64 * 1024).unwrap()
    }

    fn assert_blocked(source: &str, label: &str) {
        let verdict = policy().check(source);
        assert!(verdict.blocked, "expected block for: {}", source);
        assert_eq!(verdict.reason.unwrap(), blocked_reason(label));
    }

    fn assert_allowed(source: &str) {
        let verdict = policy().check(source);
        assert!(!verdict.blocked, "unexpected block for {}: {:?}", source, verdict.reason);
    }

    #[test]
    fn test_plain_solution_is_allowed() {
        assert_allowed("def add(a, b):\n    return a + b\n");
        assert_allowed("import math\nfrom collections import deque\nimport heapq as hq\n");
    }

    #[test]
    fn test_import_forms_are_blocked() {
        assert_blocked("import os\n", "os");
        assert_blocked("import os.path\n", "os");
        assert_blocked("from subprocess import run\n", "subprocess");
        assert_blocked("import math, socket\n", "socket");
        assert_blocked("import math as m, threading\n", "threading");
        assert_blocked("from urllib.request import urlopen\n", "urllib");
    }

    #[test]
    fn test_low_level_capability_modules_are_blocked() {
        assert_blocked("import posix\nposix.system('id')\n", "posix");
        assert_blocked("from _posixsubprocess import fork_exec\n", "_posixsubprocess");
        assert_blocked("import io; io.open('x')\n", "io");
        assert_blocked("from _io import FileIO\n", "_io");
        assert_blocked("import _thread\n", "_thread");
        assert_blocked("import gc\ngc.get_objects()\n", "gc");
        assert_allowed("import ioutils_local\n");
    }

    #[test]
    fn test_module_name_prefixes_do_not_match() {
        assert_allowed("import osmosis\n");
        assert_allowed("import system_utils\n");
        assert_allowed("from sysconfig_helpers import x\n");
    }

    #[test]
    fn test_builtin_calls_are_blocked() {
        assert_blocked("x = eval('1 + 1')\n", "eval()");
        assert_blocked("exec (code)\n", "exec()");
        assert_blocked("f = open('/etc/passwd')\n", "open()");
        assert_blocked("m = __import__('os')\n", "__import__()");
        assert_blocked("breakpoint()\n", "breakpoint()");
    }

    #[test]
    fn test_method_calls_with_builtin_names_are_allowed() {
        assert_allowed("result = parser.eval(tree)\n");
        assert_allowed("conn.open()\n");
        assert_allowed("evaluate(x)\n");
    }

    #[test]
    fn test_reflection_attributes_are_blocked() {
        assert_blocked("object.__subclasses__()\n", "__subclasses__");
        assert_blocked("fn.__globals__['x']\n", "__globals__");
        assert_blocked("print.__self__.len = None\n", "__self__");
    }

    #[test]
    fn test_matching_is_lexical() {
        // A denied name inside a comment still blocks.
        assert_blocked("# remember to import os later\n", "os");
    }

    #[test]
    fn test_extra_modules_are_honored() {
        let policy = Policy::new(&["pickle".to_string(), " ".to_string()], 1024).unwrap();
        let verdict = policy.check("import pickle\n");
        assert!(verdict.blocked);
        assert_eq!(verdict.reason.unwrap(), blocked_reason("pickle"));
    }

    #[test]
    fn test_oversized_source_is_blocked() {
        let policy = Policy::new(&[], 16).unwrap();
        let verdict = policy.check("def f():\n    return 1234567890\n");
        assert!(verdict.blocked);
        assert!(verdict.reason.unwrap().contains("maximum size"));
    }

    #[test]
    fn test_check_is_deterministic() {
        let source = "import sys\nimport os\n";
        assert_eq!(policy().check(source), policy().check(source));
        assert_blocked(source, "os");
    }
}
