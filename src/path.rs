//! Socket path resolution.
//!
//! A short name like `"control"` becomes `$XDG_RUNTIME_DIR/control` (or one of
//! the other runtime directories, in order). Absolute names are used as is.
//!
//! Lookup order for relative names:
//!
//! 1. `PIPEWIRE_RUNTIME_DIR`
//! 2. `XDG_RUNTIME_DIR`
//! 3. `HOME`
//! 4. `USERPROFILE`
//! 5. the current user's home directory from the password database

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variables consulted for relative names, in order.
pub const RUNTIME_DIR_VARS: [&str; 4] = [
    "PIPEWIRE_RUNTIME_DIR",
    "XDG_RUNTIME_DIR",
    "HOME",
    "USERPROFILE",
];

/// Longest path that fits in `sockaddr_un.sun_path` with its NUL terminator.
pub const MAX_SOCK_PATH: usize = 107;

/// Resolve `name` against the process environment.
pub fn resolve(name: impl AsRef<Path>) -> Result<PathBuf> {
    resolve_with(
        name,
        |key| std::env::var_os(key).map(PathBuf::from),
        dirs::home_dir,
    )
}

/// Resolve `name` with injectable variable and home-directory lookups.
///
/// Empty variables count as unset.
pub fn resolve_with<L, H>(name: impl AsRef<Path>, lookup: L, home: H) -> Result<PathBuf>
where
    L: Fn(&str) -> Option<PathBuf>,
    H: FnOnce() -> Option<PathBuf>,
{
    let name = name.as_ref();

    let path = if name.is_absolute() {
        name.to_path_buf()
    } else {
        let runtime_dir = RUNTIME_DIR_VARS
            .iter()
            .find_map(|var| lookup(var).filter(|dir| !dir.as_os_str().is_empty()))
            .or_else(home)
            .ok_or_else(|| Error::Path(name.display().to_string()))?;
        runtime_dir.join(name)
    };

    let len = path.as_os_str().len();
    if len > MAX_SOCK_PATH {
        return Err(Error::PathTooLong {
            path: path.display().to_string(),
            len,
            max: MAX_SOCK_PATH,
        });
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pairs = &'static [(&'static str, &'static str)];

    fn env_of(pairs: Pairs) -> impl Fn(&str) -> Option<PathBuf> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| PathBuf::from(v))
        }
    }

    fn no_home() -> Option<PathBuf> {
        None
    }

    fn resolved(name: &str, env: impl Fn(&str) -> Option<PathBuf>) -> PathBuf {
        resolve_with(name, env, no_home).unwrap()
    }

    #[test]
    fn test_relative_name_uses_xdg_runtime_dir() {
        let env = env_of(&[("XDG_RUNTIME_DIR", "/run/user/1000")]);
        assert_eq!(resolved("foo", env), PathBuf::from("/run/user/1000/foo"));
    }

    #[test]
    fn test_absolute_name_is_unchanged() {
        let env = env_of(&[("XDG_RUNTIME_DIR", "/run/user/1000")]);
        assert_eq!(resolved("/tmp/foo", env), PathBuf::from("/tmp/foo"));
    }

    #[test]
    fn test_lookup_order() {
        let env = env_of(&[
            ("HOME", "/home/me"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("PIPEWIRE_RUNTIME_DIR", "/run/pw"),
        ]);
        assert_eq!(resolved("s", env), PathBuf::from("/run/pw/s"));

        let env = env_of(&[("HOME", "/home/me"), ("USERPROFILE", "/users/me")]);
        assert_eq!(resolved("s", env), PathBuf::from("/home/me/s"));

        let env = env_of(&[("USERPROFILE", "/users/me")]);
        assert_eq!(resolved("s", env), PathBuf::from("/users/me/s"));
    }

    #[test]
    fn test_falls_back_to_password_database_home() {
        let home = || Some(PathBuf::from("/var/lib/svc"));
        let path = resolve_with("s", env_of(&[]), home).unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/svc/s"));
    }

    #[test]
    fn test_empty_variable_is_skipped() {
        let env = env_of(&[("XDG_RUNTIME_DIR", ""), ("HOME", "/home/me")]);
        assert_eq!(resolved("s", env), PathBuf::from("/home/me/s"));
    }

    #[test]
    fn test_unresolvable_relative_name_fails() {
        let err = resolve_with("foo", env_of(&[]), no_home).unwrap_err();
        assert!(matches!(err, Error::Path(ref name) if name == "foo"));
    }

    #[test]
    fn test_path_too_long_fails() {
        let long = format!("/tmp/{}", "x".repeat(200));
        let err = resolve_with(&long, env_of(&[]), no_home).unwrap_err();
        assert!(matches!(err, Error::PathTooLong { len, .. } if len == long.len()));
    }
}
