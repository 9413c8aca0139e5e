//! Cache keys recorded as commit comments

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Key for a verb invocation: its name and stringified arguments
///
/// The parts are encoded as a JSON array so argument boundaries survive;
/// `run "a, b"` and `run "a", "b"` must not share a key.
pub fn verb_key(verb: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(verb);
    parts.extend(args.iter().map(String::as_str));
    STANDARD.encode(serde_json::Value::from(parts).to_string())
}

/// Key for a copy, from the checksum of the rewritten archive
pub fn copy_key(archive_sum: &str) -> String {
    format!("kiln:copy {}", archive_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn deterministic() {
        assert_eq!(
            verb_key("run", &args(&["make"])),
            verb_key("run", &args(&["make"]))
        );
    }

    #[test]
    fn any_difference_changes_key() {
        let base = verb_key("run", &args(&["make"]));
        assert_ne!(base, verb_key("run", &args(&["make all"])));
        assert_ne!(base, verb_key("user", &args(&["make"])));
        assert_ne!(base, verb_key("run", &args(&["make", "x"])));
        assert_ne!(
            verb_key("run", &args(&["a, b"])),
            verb_key("run", &args(&["a", "b"]))
        );
        assert_ne!(verb_key("run", &args(&[""])), verb_key("run", &[]));
    }

    #[test]
    fn encodes_argument_list() {
        assert_eq!(verb_key("user", &args(&["root"])), STANDARD.encode(r#"["user","root"]"#));
        assert_eq!(verb_key("cmd", &[]), STANDARD.encode(r#"["cmd"]"#));
    }

    #[test]
    fn copy_key_names_checksum() {
        assert_eq!(copy_key("abc"), "kiln:copy abc");
    }
}
