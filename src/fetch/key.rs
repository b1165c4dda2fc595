//! Cache keys for fetched documents
//!
//! A key is the logical document path plus a stable-ordered argument map.
//! The arguments come from a whitelisted subset of request headers so that,
//! for example, two different bearer tokens fetching the same indirected
//! path never alias to the same cached file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use md5::{Digest, Md5};

/// Composite identifier for a fetchable document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    path: String,
    args: BTreeMap<String, String>,
}

impl FetchKey {
    pub fn new(path: impl Into<String>) -> Self {
        FetchKey {
            path: path.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_args(path: impl Into<String>, args: BTreeMap<String, String>) -> Self {
        let args = args
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        FetchKey {
            path: path.into(),
            args,
        }
    }

    /// Build a key from a request path and headers, keeping only the
    /// whitelisted header names (compared lower-cased).
    pub fn from_request<'a, I>(path: impl Into<String>, headers: I, whitelist: &[String]) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut args = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if whitelist.contains(&name) {
                args.insert(name, value.to_string());
            }
        }
        FetchKey {
            path: path.into(),
            args,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// Argument map rendered as `k=v` pairs in key order. The BTreeMap makes
    /// the ordering stable across processes.
    fn canonical_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Deterministic relative storage path: `<hh>/<md5hex>[_<argshash>].<ext>`
    /// where `hh` is the first two hex characters of the path digest. The
    /// argument-hash suffix keeps differently-credentialed downloads of the
    /// same path apart on disk.
    pub fn storage_rel_path(&self, default_extension: &str) -> PathBuf {
        let digest = hex::encode(Md5::digest(self.path.as_bytes()));
        let prefix = &digest[..2];

        let mut name = digest.clone();
        if !self.args.is_empty() {
            let args_digest = hex::encode(Md5::digest(self.canonical_args().as_bytes()));
            name.push('_');
            name.push_str(&args_digest);
        }
        name.push_str(&self.extension(default_extension));

        PathBuf::from(prefix).join(name)
    }

    /// Extension of the final path component, accepted only when the dot
    /// falls within the last five characters; otherwise the default.
    fn extension(&self, default_extension: &str) -> String {
        let last = self.path.rsplit('/').next().unwrap_or(&self.path);
        match last.rfind('.') {
            Some(dot) if dot + 6 > last.len() && dot > 0 => last[dot..].to_string(),
            _ => default_extension.to_string(),
        }
    }
}

impl std::fmt::Display for FetchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}?{}", self.path, self.canonical_args())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_path_is_deterministic() {
        let a = FetchKey::new("bucket-a/sample.pdf");
        let b = FetchKey::new("bucket-a/sample.pdf");
        assert_eq!(a.storage_rel_path(".pdf"), b.storage_rel_path(".pdf"));
    }

    #[test]
    fn storage_path_uses_two_level_hash_prefix() {
        let key = FetchKey::new("bucket-a/sample.pdf");
        let rel = key.storage_rel_path(".pdf");
        let prefix = rel.parent().unwrap().to_str().unwrap();
        let name = rel.file_name().unwrap().to_str().unwrap();
        assert_eq!(prefix.len(), 2);
        assert!(name.starts_with(prefix));
        assert!(name.ends_with(".pdf"));
    }

    #[test]
    fn keeps_source_extension_when_short() {
        let key = FetchKey::new("bucket-a/drawing.svg");
        let rel = key.storage_rel_path(".pdf");
        assert!(rel.to_str().unwrap().ends_with(".svg"));
    }

    #[test]
    fn falls_back_to_default_extension() {
        let key = FetchKey::new("bucket-a/no-extension");
        let rel = key.storage_rel_path(".pdf");
        assert!(rel.to_str().unwrap().ends_with(".pdf"));

        // A dot too far from the end is not an extension.
        let key = FetchKey::new("bucket-a/archive.backup-file");
        let rel = key.storage_rel_path(".pdf");
        assert!(rel.to_str().unwrap().ends_with(".pdf"));
    }

    #[test]
    fn args_change_the_storage_path() {
        let plain = FetchKey::new("dropbox/abc");
        let mut args = BTreeMap::new();
        args.insert("authorization".to_string(), "Bearer xyz".to_string());
        let with_args = FetchKey::with_args("dropbox/abc", args);
        assert_ne!(
            plain.storage_rel_path(".pdf"),
            with_args.storage_rel_path(".pdf")
        );
    }

    #[test]
    fn args_are_lowercased_and_order_stable() {
        let mut a = BTreeMap::new();
        a.insert("Authorization".to_string(), "x".to_string());
        a.insert("Dropbox-Token".to_string(), "y".to_string());
        let mut b = BTreeMap::new();
        b.insert("dropbox-token".to_string(), "y".to_string());
        b.insert("authorization".to_string(), "x".to_string());
        assert_eq!(
            FetchKey::with_args("p", a).storage_rel_path(".pdf"),
            FetchKey::with_args("p", b).storage_rel_path(".pdf")
        );
    }

    #[test]
    fn from_request_filters_by_whitelist() {
        let whitelist = vec!["authorization".to_string()];
        let key = FetchKey::from_request(
            "bucket-a/sample.pdf",
            vec![("Authorization", "Bearer x"), ("Accept", "image/png")],
            &whitelist,
        );
        assert_eq!(key.args().len(), 1);
        assert_eq!(key.args().get("authorization").unwrap(), "Bearer x");
    }

    #[test]
    fn different_header_values_make_different_keys() {
        let whitelist = vec!["authorization".to_string()];
        let a = FetchKey::from_request("p", vec![("authorization", "a")], &whitelist);
        let b = FetchKey::from_request("p", vec![("authorization", "b")], &whitelist);
        assert_ne!(a, b);
    }
}
