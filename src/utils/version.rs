// plexbackup/src/utils/version.rs

/// Build metadata baked in at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub revision: Option<&'static str>,
    pub built_by: Option<&'static str>,
}

static BUILD_INFO: BuildInfo = BuildInfo {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
    revision: option_env!("PLEXBACKUP_REVISION"),
    built_by: option_env!("PLEXBACKUP_BUILT_BY"),
};

pub fn build_info() -> &'static BuildInfo {
    &BUILD_INFO
}

impl BuildInfo {
    /// One line suitable for `--version` and the startup log.
    pub fn summary(&self) -> String {
        let mut summary = format!("{} {}", self.name, self.version);
        if let Some(revision) = self.revision.filter(|r| !r.is_empty()) {
            summary.push('-');
            summary.push_str(revision);
        }
        if let Some(built_by) = self.built_by.filter(|b| !b.is_empty()) {
            summary.push_str(" (built by ");
            summary.push_str(built_by);
            summary.push(')');
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_without_optional_fields() {
        let info = BuildInfo { name: "plexbackup", version: "1.2.3", revision: None, built_by: None };
        assert_eq!(info.summary(), "plexbackup 1.2.3");
    }

    #[test]
    fn test_summary_with_revision_and_builder() {
        let info = BuildInfo {
            name: "plexbackup",
            version: "1.2.3",
            revision: Some("a1b2c3d"),
            built_by: Some("ci"),
        };
        assert_eq!(info.summary(), "plexbackup 1.2.3-a1b2c3d (built by ci)");
    }

    #[test]
    fn test_empty_revision_is_ignored() {
        let info = BuildInfo { name: "plexbackup", version: "0.1.0", revision: Some(""), built_by: None };
        assert_eq!(info.summary(), "plexbackup 0.1.0");
    }

    #[test]
    fn test_build_info_comes_from_package() {
        let info = build_info();
        assert_eq!(info.name, "plexbackup");
        assert!(info.summary().starts_with("plexbackup "));
    }
}
