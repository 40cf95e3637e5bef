//! Tree construction from configuration.
//!
//! Each telescope listed under `tree_build.telescopes` gets the standard
//! stack, leaves first: hardware adapter -> access gate (with its grantor as
//! a named sibling under a default-target broker) -> cache -> conditional
//! freezer -> site provider. All site providers hang off one front broker.

use ocs_common::Settings;
use ocs_tree::alpaca::devices::DeviceConfigError;
use ocs_tree::component::{DynAddressed, DynComponent};
use ocs_tree::{
    TreeAccessGrantor, TreeAlpacaObservatory, TreeBroker, TreeBrokerDefaultTarget, TreeCache,
    TreeConditionalFreezer, TreeProvider, TreeRequestBlocker,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no telescopes configured under tree_build.telescopes")]
    NoTelescopes,
    #[error("telescope {name}: {source}")]
    Device {
        name: String,
        source: DeviceConfigError,
    },
}

#[derive(Debug, Deserialize)]
struct TelescopeSpec {
    /// Address segment the telescope answers to.
    source_name: String,
    /// Adapter component instance name (`tree.<adapter>` carries its
    /// options and device tree).
    adapter: String,
    /// Identity published on the status streams; defaults to the source
    /// name.
    observatory_name: Option<String>,
}

pub fn build_tree(settings: &Settings) -> Result<DynComponent, BuildError> {
    let specs: Vec<TelescopeSpec> = settings
        .get(&["tree_build", "telescopes"])
        .unwrap_or_default();
    if specs.is_empty() {
        return Err(BuildError::NoTelescopes);
    }

    let mut providers: Vec<DynAddressed> = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = &spec.source_name;
        let observatory_name = spec.observatory_name.as_deref().unwrap_or(name);

        let adapter: DynComponent = Arc::new(
            TreeAlpacaObservatory::new(&spec.adapter, Some(observatory_name), settings).map_err(
                |source| BuildError::Device {
                    name: name.clone(),
                    source,
                },
            )?,
        );
        let blocker = Arc::new(TreeRequestBlocker::new(
            &format!("{name}_blocker"),
            adapter,
            settings,
        ));
        let grantor: DynAddressed = Arc::new(TreeAccessGrantor::new(
            &format!("{name}_grantor"),
            "access",
            blocker.clone(),
        ));
        let broker = Arc::new(TreeBrokerDefaultTarget::new(
            &format!("{name}_broker"),
            vec![grantor],
            blocker,
        ));
        let cache = Arc::new(TreeCache::new(&format!("{name}_cache"), broker, settings));
        let freezer = Arc::new(TreeConditionalFreezer::new(
            &format!("{name}_freezer"),
            cache,
            settings,
        ));
        providers.push(Arc::new(TreeProvider::new(
            &format!("{name}_provider"),
            name,
            freezer,
        )));
        info!(telescope = %name, adapter = %spec.adapter, "telescope stack built");
    }

    Ok(Arc::new(TreeBroker::new("front_broker", providers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocs_tree::ProvidesResponse;

    const SAMPLE: &str = r#"
tree_build:
  telescopes:
    - source_name: zb08
      adapter: zb08_adapter
tree:
  zb08_adapter:
    observatory:
      address: "http://localhost:11111/api/v1"
      protocol: alpaca
      components:
        telescope: {kind: telescope, device_number: 0}
"#;

    #[test]
    fn builds_the_standard_stack() {
        let settings = Settings::from_yaml_str(SAMPLE).unwrap();
        let root = build_tree(&settings).unwrap();
        let configuration = root.configuration();
        let front = &configuration["front_broker"];
        assert_eq!(front["type"], "TreeBroker");
        // The adapter sits at the bottom of the telescope chain.
        let rendered = configuration.to_string();
        assert!(rendered.contains("TreeAlpacaObservatory"));
        assert!(rendered.contains("zb08_freezer"));
    }

    #[test]
    fn empty_configuration_is_a_build_failure() {
        let settings = Settings::from_yaml_str("{}").unwrap();
        assert!(matches!(build_tree(&settings), Err(BuildError::NoTelescopes)));
    }
}
