//! OS identity used as the tail of every patch id.

use std::path::Path;

use fs_err as fs;

pub const UNKNOWN_OS_IDENTITY: &str = "unknownDist_unknownVer";
const OS_RELEASE_PATH: &str = "/etc/os-release";

/// `<NAME>_<VERSION_ID>` from `/etc/os-release`, or [`UNKNOWN_OS_IDENTITY`].
pub fn os_identity() -> String {
    os_identity_from(Path::new(OS_RELEASE_PATH))
}

pub fn os_identity_from(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => parse_os_release(&content),
        Err(err) => {
            tracing::debug!(error = %err, "os-release unavailable");
            UNKNOWN_OS_IDENTITY.to_string()
        }
    }
}

fn parse_os_release(content: &str) -> String {
    let field = |key: &str| {
        content.lines().find_map(|line| {
            let value = line.strip_prefix(key)?.strip_prefix('=')?;
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        })
    };
    match (field("NAME"), field("VERSION_ID")) {
        (Some(name), Some(version)) => format!("{}_{}", name, version),
        _ => UNKNOWN_OS_IDENTITY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04 LTS\"\n";
        assert_eq!(parse_os_release(content), "Ubuntu_22.04");
    }

    #[test]
    fn test_parse_os_release_keeps_name_verbatim() {
        let content = "NAME=\"Red Hat Enterprise Linux Server\"\nVERSION_ID=\"7.5\"\n";
        assert_eq!(
            parse_os_release(content),
            "Red Hat Enterprise Linux Server_7.5"
        );
    }

    #[test]
    fn test_missing_fields_fall_back() {
        assert_eq!(parse_os_release("ID=debian\n"), UNKNOWN_OS_IDENTITY);
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(
            os_identity_from(&temp.path().join("missing")),
            UNKNOWN_OS_IDENTITY
        );
    }
}
