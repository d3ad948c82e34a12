//! Prints the FeatureFlag CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run -p crds --bin crdgen > deploy/crd.yaml
//! ```

use crds::FeatureFlag;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&FeatureFlag::crd())?);
    Ok(())
}
