use rand::RngCore;
use std::collections::BTreeMap;

/// Number of random bytes appended to generated instance names.
const NAME_TOKEN_BYTES: usize = 3;

/// String helpers for instance naming and environment rendering.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"`, `"on"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"`, `"off"`.
    /// Returns `None` for anything else.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Generate a managed instance name: `<prefix>-<6 hex chars>`.
    pub fn make_instance_name(prefix: &str) -> String {
        let mut token = [0u8; NAME_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut token);
        format!("{}-{}", prefix, hex::encode(token))
    }

    /// True when `name` was produced by [`StringUtil::make_instance_name`]
    /// for the same prefix.
    pub fn has_managed_prefix(name: &str, prefix: &str) -> bool {
        name.len() > prefix.len() + 1
            && name.starts_with(prefix)
            && name.as_bytes()[prefix.len()] == b'-'
    }

    /// Render `KEY=value` lines, one per entry, in key order.
    pub fn env_file(vars: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        for (key, value) in vars {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_to_bool() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool(" yes "), Some(true));
        assert_eq!(StringUtil::convert_to_bool("0"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("off"), Some(false));
        assert_eq!(StringUtil::convert_to_bool(""), None);
        assert_eq!(StringUtil::convert_to_bool("maybe"), None);
    }

    #[test]
    fn test_make_instance_name() {
        let name = StringUtil::make_instance_name("lxdrunner");
        assert!(name.starts_with("lxdrunner-"));
        assert_eq!(name.len(), "lxdrunner-".len() + 6);
        assert!(StringUtil::has_managed_prefix(&name, "lxdrunner"));
    }

    #[test]
    fn test_names_are_unique_enough() {
        let a = StringUtil::make_instance_name("r");
        let b = StringUtil::make_instance_name("r");
        let c = StringUtil::make_instance_name("r");
        assert!(a != b || b != c);
    }

    #[test]
    fn test_has_managed_prefix() {
        assert!(StringUtil::has_managed_prefix("lxdrunner-a1b2c3", "lxdrunner"));
        assert!(!StringUtil::has_managed_prefix("lxdrunnerx-a1b2c3", "lxdrunner"));
        assert!(!StringUtil::has_managed_prefix("lxdrunner-", "lxdrunner"));
        assert!(!StringUtil::has_managed_prefix("web-01", "lxdrunner"));
        assert!(!StringUtil::has_managed_prefix("lxd", "lxdrunner"));
    }

    #[test]
    fn test_env_file() {
        let mut vars = BTreeMap::new();
        vars.insert("GHA_URL".to_string(), "https://github.com/org".to_string());
        vars.insert("GHA_NAME".to_string(), "lxdrunner-abcdef".to_string());
        assert_eq!(
            StringUtil::env_file(&vars),
            "GHA_NAME=lxdrunner-abcdef\nGHA_URL=https://github.com/org\n"
        );
        assert_eq!(StringUtil::env_file(&BTreeMap::new()), "");
    }
}
