//! Parsing of container image references into their structural parts.
//!
//! The grammar here deliberately mirrors how the swap engine needs to look at
//! an image, not the full OCI reference grammar: registries are only
//! recognized when the first path segment contains a `.`, matching the
//! upstream tool this behavior is ported from.

use std::fmt;

/// The tag-or-digest suffix of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    None,
    Tag(String),
    Digest(String),
}

/// A parsed image reference.
///
/// `parse` never fails: any string is representable, worst case as a bare
/// repository against the implicit `docker.io` registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub registry_port: Option<u16>,
    /// Whether the input textually carried a registry host, vs. `registry`
    /// being the implicit `docker.io` default.
    pub explicit_registry: bool,
    pub repository: String,
    pub selector: Selector,
    pub original: String,
    /// True when this is a Docker Hub "library" image (e.g. `nginx`, which
    /// the registry resolves as `library/nginx`).
    pub is_library: bool,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let (left, rest) = match image.split_once('/') {
            Some((l, r)) => (l, Some(r)),
            None => (image, None),
        };

        let has_registry = left.contains('.') && rest.is_some_and(|r| !r.is_empty());

        let (registry, registry_port, explicit_registry, body) = if has_registry {
            let rest = rest.unwrap();
            let (host, port) = match left.split_once(':') {
                Some((h, p)) => (h.to_string(), p.parse::<u16>().ok()),
                None => (left.to_string(), None),
            };
            (host, port, true, rest.to_string())
        } else {
            ("docker.io".to_string(), None, false, image.to_string())
        };

        let (repository, selector) = split_body(&body);
        let is_library = !explicit_registry && !repository.contains('/');

        ImageRef {
            registry,
            registry_port,
            explicit_registry,
            repository,
            selector,
            original: image.to_string(),
            is_library,
        }
    }

    /// Reconstructs the image string from the parsed parts. For any
    /// reference this crate can parse, `ImageRef::parse(s).render() == s`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.explicit_registry {
            out.push_str(&self.registry);
            if let Some(port) = self.registry_port {
                out.push(':');
                out.push_str(&port.to_string());
            }
            out.push('/');
        }
        out.push_str(&self.repository);
        match &self.selector {
            Selector::None => {}
            Selector::Tag(tag) => {
                out.push(':');
                out.push_str(tag);
            }
            Selector::Digest(digest) => {
                out.push('@');
                out.push_str(digest);
            }
        }
        out
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Splits a registry-stripped body into `(repository, selector)`. The
/// selector separator is only recognized in the final path segment, so a
/// port-like `:` earlier in the body (there shouldn't be one once the
/// registry has been stripped, but a caller may hand in a whole reference)
/// never gets mistaken for a tag.
fn split_body(body: &str) -> (String, Selector) {
    let tail_start = body.rfind('/').map(|i| i + 1).unwrap_or(0);
    let tail = &body[tail_start..];

    if let Some(at) = tail.find('@') {
        let repository = format!("{}{}", &body[..tail_start], &tail[..at]);
        (repository, Selector::Digest(tail[at + 1..].to_string()))
    } else if let Some(colon) = tail.find(':') {
        let repository = format!("{}{}", &body[..tail_start], &tail[..colon]);
        (repository, Selector::Tag(tail[colon + 1..].to_string()))
    } else {
        (body.to_string(), Selector::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_library_image_has_no_slash() {
        let img = ImageRef::parse("nginx");
        assert_eq!(img.registry, "docker.io");
        assert!(!img.explicit_registry);
        assert_eq!(img.repository, "nginx");
        assert_eq!(img.selector, Selector::None);
        assert!(img.is_library);
    }

    #[test]
    fn library_image_with_tag() {
        let img = ImageRef::parse("rabbitmq:3.8.18-management");
        assert_eq!(img.repository, "rabbitmq");
        assert_eq!(img.selector, Selector::Tag("3.8.18-management".to_string()));
        assert!(img.is_library);
    }

    #[test]
    fn namespaced_dockerhub_image_is_not_library() {
        let img = ImageRef::parse("mysql/mysql-server:5.6");
        assert!(!img.explicit_registry);
        assert_eq!(img.repository, "mysql/mysql-server");
        assert!(!img.is_library);
    }

    #[test]
    fn registry_with_port() {
        let img = ImageRef::parse("cool.io:443/istio/istiod");
        assert!(img.explicit_registry);
        assert_eq!(img.registry, "cool.io");
        assert_eq!(img.registry_port, Some(443));
        assert_eq!(img.repository, "istio/istiod");
        assert_eq!(img.selector, Selector::None);
    }

    #[test]
    fn digest_reference() {
        let img = ImageRef::parse(
            "my.example.com/base/image@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
        assert_eq!(img.repository, "base/image");
        match &img.selector {
            Selector::Digest(d) => assert!(d.starts_with("sha256:")),
            other => panic!("expected digest selector, got {other:?}"),
        }
    }

    #[test]
    fn host_without_dot_is_not_treated_as_registry() {
        // Matches the ported behavior: a registry is only recognized when
        // the first path segment contains a literal `.`.
        let img = ImageRef::parse("localhost:5000/myapp");
        assert!(!img.explicit_registry);
        assert_eq!(img.registry, "docker.io");
        assert_eq!(img.repository, "localhost:5000/myapp");
    }

    #[test]
    fn round_trip_preserves_original() {
        for s in [
            "nginx",
            "rabbitmq:3.8.18-management",
            "mysql/mysql-server:5.6",
            "cool.io:443/istio/istiod",
            "default.io/paulbower/hello-kubernetes:1.5",
        ] {
            let img = ImageRef::parse(s);
            assert_eq!(img.render(), s);
            let reparsed = ImageRef::parse(&img.render());
            assert_eq!(img, reparsed);
        }
    }
}
