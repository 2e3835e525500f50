use camino::Utf8Path;

/// Normalize a path-in-image: strip a leading `./`, reject absolute paths
/// and empty paths. Tar entry names are always relative.
pub fn require_relative(path: &Utf8Path) -> anyhow::Result<&Utf8Path> {
    let path = path.strip_prefix("./").unwrap_or(path);
    if path.as_str().is_empty() {
        anyhow::bail!("Empty path");
    }
    if path.is_absolute() {
        anyhow::bail!("Absolute path not allowed: {path}");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_relative() {
        assert_eq!(require_relative("./usr/bin".into()).unwrap(), "usr/bin");
        assert_eq!(require_relative("usr/bin".into()).unwrap(), "usr/bin");
        assert!(require_relative("/usr/bin".into()).is_err());
        assert!(require_relative("".into()).is_err());
        assert!(require_relative("./".into()).is_err());
    }
}
