/// Translates logical paths to object keys under a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    /// Root directory without trailing slashes; may be empty.
    root: String,
}

impl KeyMapper {
    pub fn new(root_directory: &str) -> Self {
        Self {
            root: root_directory.trim_end_matches('/').to_string(),
        }
    }

    /// Object key for `path`. Leading slashes never reach the store.
    pub fn key(&self, path: &str) -> String {
        format!("{}{}", self.root, path)
            .trim_start_matches('/')
            .to_string()
    }

    /// Key prefix shared by everything below `path`.
    ///
    /// For the root path with an empty root directory this is the empty
    /// prefix, which lists the whole bucket.
    pub fn dir_prefix(&self, path: &str) -> String {
        let key = self.key(path.trim_end_matches('/'));
        if key.is_empty() {
            key
        } else {
            format!("{key}/")
        }
    }

    /// Logical path for a key returned by a listing.
    pub fn path(&self, key: &str) -> String {
        let root = self.key("");
        let rest = key.strip_prefix(root.as_str()).unwrap_or(key);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root() {
        let keys = KeyMapper::new("");
        assert_eq!(keys.key("/docker/registry"), "docker/registry");
        assert_eq!(keys.key("/"), "");
        assert_eq!(keys.dir_prefix("/"), "");
        assert_eq!(keys.dir_prefix("/docker"), "docker/");
        assert_eq!(keys.path("docker/registry"), "/docker/registry");
    }

    #[test]
    fn nested_root_is_normalized() {
        for root in ["/registry/data", "/registry/data/", "registry/data"] {
            let keys = KeyMapper::new(root);
            assert_eq!(keys.key("/a/b"), "registry/data/a/b", "root {root:?}");
            assert_eq!(keys.dir_prefix("/"), "registry/data/");
            assert_eq!(keys.dir_prefix("/a"), "registry/data/a/");
            assert_eq!(keys.path("registry/data/a/b"), "/a/b");
        }
    }

    #[test]
    fn path_round_trips_through_key() {
        let keys = KeyMapper::new("/root");
        for path in ["/a", "/a/b/c", "/_uploads/x.startedat"] {
            assert_eq!(keys.path(&keys.key(path)), path);
        }
    }

    #[test]
    fn directory_prefixes_map_back_to_paths() {
        let keys = KeyMapper::new("root");
        // Common prefixes come back with their delimiter.
        let prefix = "root/a/sub/";
        assert_eq!(keys.path(prefix.trim_end_matches('/')), "/a/sub");
    }
}
