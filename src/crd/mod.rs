//! Custom Resource Definitions for the sample controllers
//!
//! The API group is registered explicitly through the `CustomResource` derive,
//! so there is no process-wide scheme to populate at startup.


pub use test::{Test, TestSpec, TestStatus};

/// API group served by the sample controllers
pub const API_GROUP: &str = "domainlocal.my.domain";

/// API version of the sample resources
pub const API_VERSION: &str = "v1alpha1";

/// YAML manifest of every CRD served by this crate
pub fn manifest() -> crate::Result<String> {
    use kube::CustomResourceExt;

    Ok(serde_yaml::to_string(&Test::crd())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    #[test]
    fn manifest_is_a_loadable_crd() {
        let yaml = manifest().unwrap();
        let crd: CustomResourceDefinition = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(crd.spec.group, API_GROUP);
        assert_eq!(crd.spec.names.kind, "Test");
        assert_eq!(crd.spec.versions[0].name, API_VERSION);
    }
}
