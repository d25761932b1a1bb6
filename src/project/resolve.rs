//! project::resolve
//!
//! Dependency resolution.
//!
//! An input URI names a product of another resource, pinned or mutable.
//! Resolving it picks a concrete version, brings the product into the
//! local cache and reports the pinned URI actually consumed. Registering
//! the consumer is left to the caller, which knows who the consumer is.

use tracing::debug;

use super::product::{product_uri, Product};
use super::Project;
use crate::core::metadata::InputEntry;
use crate::core::types::{ConflictPolicy, ProductType};
use crate::core::uri::{Uri, UriVersion};
use crate::error::{PulseError, Result};

/// How an input is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveOptions {
    /// Outcome when a download would overwrite a local work.
    pub policy: ConflictPolicy,
    /// Use a local work ahead of the last commit when the URI is mutable.
    pub prefer_work: bool,
}

impl ResolveOptions {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            prefer_work: false,
        }
    }

    pub fn prefer_work(mut self, prefer_work: bool) -> Self {
        self.prefer_work = prefer_work;
        self
    }
}

/// A resolved input.
#[derive(Debug, Clone)]
pub struct Resolved<'p> {
    pub product: Product<'p>,
    /// `<resource>@<version>/<product>` of the consumed product
    pub pinned: Uri,
    pub version: u32,
    /// True when a local work serves the input
    pub from_work: bool,
}

/// The product type named by an input URI.
pub(crate) fn input_product_type(uri: &Uri) -> Result<ProductType> {
    let product_type = uri.product_type().ok_or_else(|| PulseError::InvalidUri {
        uri: uri.to_string(),
        reason: "an input must name a product, as in <entity>-<type>/<product>".to_string(),
    })?;
    Ok(ProductType::new(product_type)?)
}

/// Pinned URI of the product an input entry consumes.
pub(crate) fn consumed_product(entry: &InputEntry) -> Result<Uri> {
    product_uri(
        &entry.uri,
        entry.resolved_version,
        &input_product_type(&entry.uri)?,
    )
}

/// Resolve `uri` to a local product, downloading it if needed.
pub(crate) fn resolve_input<'p>(
    project: &'p Project,
    uri: &Uri,
    policy: ConflictPolicy,
    prefer_work: bool,
) -> Result<Resolved<'p>> {
    let product_type = input_product_type(uri)?;
    let resource = project.resource(uri)?;

    if prefer_work && uri.is_mutable() {
        if let Some(work) = project.find_work(uri)? {
            if work.version() > resource.last_version() {
                debug!(input = %uri, version = work.version(), "input served by local work");
                let product = work.get_product(&product_type)?;
                return Ok(Resolved {
                    pinned: product_uri(uri, work.version(), &product_type)?,
                    version: work.version(),
                    product: Product::Work(product),
                    from_work: true,
                });
            }
        }
    }

    let version = match uri.version() {
        Some(UriVersion::Number(v)) => UriVersion::Number(v),
        Some(UriVersion::Last) | None => UriVersion::Last,
    };
    let commit = resource.get_commit(version)?;
    let product = commit
        .get_product(&product_type)?
        .download(policy, uri.product_subpath())?;
    let from_work = product.is_work_product();
    debug!(input = %uri, version = commit.version(), from_work, "input resolved");
    Ok(Resolved {
        pinned: product_uri(uri, product.version(), &product_type)?,
        version: product.version(),
        product,
        from_work,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::test_support::{publish, TestEnv};

    #[test]
    fn input_must_name_a_product() {
        let uri = Uri::parse("anna-model@2").unwrap();
        assert!(matches!(
            input_product_type(&uri),
            Err(PulseError::InvalidUri { .. })
        ));
        let uri = Uri::parse("anna-model@2/geo/lod0").unwrap();
        assert_eq!(input_product_type(&uri).unwrap().as_str(), "geo");
    }

    #[test]
    fn mutable_input_resolves_to_last_commit() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);
        publish(&project, "anna-model", &["geo"]);

        let uri = Uri::parse("anna-model@last/geo").unwrap();
        let resolved = resolve_input(&project, &uri, ConflictPolicy::Error, false).unwrap();
        assert_eq!(resolved.version, 2);
        assert_eq!(resolved.pinned.to_string(), "anna-model@2/geo");
        assert!(!resolved.from_work);

        // The local work targets v3 and wins when preferred.
        let resolved = resolve_input(&project, &uri, ConflictPolicy::Error, true).unwrap();
        assert_eq!(resolved.version, 3);
        assert!(resolved.from_work);
        assert!(resolved.product.is_work_product());
    }

    #[test]
    fn unpublished_resource_cannot_be_resolved() {
        let env = TestEnv::new();
        let project = env.project();
        project.create_resource("anna", "model", None).unwrap();
        let uri = Uri::parse("anna-model/geo").unwrap();
        assert!(matches!(
            resolve_input(&project, &uri, ConflictPolicy::Error, false),
            Err(PulseError::NotFound(_))
        ));
    }
}
