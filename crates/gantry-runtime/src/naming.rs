/// Replace every character a container engine would reject with `-`.
/// Accepted characters are `[a-zA-Z0-9_.-]`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Name of the container compiling one package.
///
/// The fixed `-gkp` closer ensures no package name is a prefix of another
/// package's container name, so prefix-matching volume cleanup cannot
/// misidentify a sibling (e.g. `nginx` vs `nginx_webdav`).
pub fn compilation_container_name(
    stemcell_image: &str,
    tool_version: &str,
    release_name: &str,
    release_version: &str,
    pkg_name: &str,
) -> String {
    sanitize_name(&format!(
        "{stemcell_image}-{tool_version}-{release_name}-{release_version}-pkg-{pkg_name}-gkp"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_name("repo/image:tag"), "repo-image-tag");
        assert_eq!(sanitize_name("a_b.c-d9"), "a_b.c-d9");
    }

    #[test]
    fn container_name_carries_closer_marker() {
        let name = compilation_container_name("opensuse/leap:15", "0.9.0", "cf", "287", "nginx");
        assert!(name.ends_with("-gkp"));
        assert!(name.contains("-pkg-nginx-"));
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }

    #[test]
    fn no_package_name_is_a_prefix_of_a_sibling() {
        let a = compilation_container_name("s", "v", "r", "1", "nginx");
        let b = compilation_container_name("s", "v", "r", "1", "nginx_webdav");
        assert!(!b.starts_with(&a));
    }
}
