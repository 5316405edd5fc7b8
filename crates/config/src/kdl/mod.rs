//! KDL configuration parsing.

mod helpers;
mod sections;

use ::kdl::KdlDocument;
use anyhow::Result;
use tracing::trace;

use crate::AutocertConfig;

pub use helpers::{get_bool_entry, get_first_arg_string, get_int_entry, get_string_entry};

/// Parse a complete configuration document
///
/// Unknown top-level nodes are rejected so that typos do not silently fall
/// back to defaults.
pub fn parse_document(content: &str) -> Result<AutocertConfig> {
    let doc: KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
        let report = miette::Report::new(e).with_source_code(content.to_string());
        anyhow::anyhow!("{:?}", report)
    })?;

    let mut config = AutocertConfig::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(node = name, "Parsing top-level node");

        match name {
            "acme" => config.acme = sections::parse_acme(node)?,
            "cache-dir" => {
                config.cache_dir = get_first_arg_string(node)
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "'cache-dir' requires a path argument, e.g., cache-dir \"/var/lib/autocert\""
                        )
                    })?
                    .into();
            }
            "renewal" => config.renewal = sections::parse_renewal(node)?,
            "hosts" => config.hosts = sections::parse_hosts(node)?,
            "listener" => config.listener = sections::parse_listener(node)?,
            "logging" => config.logging = sections::parse_logging(node),
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown configuration block '{}'. Valid blocks: acme, cache-dir, renewal, hosts, listener, logging",
                    other
                ));
            }
        }
    }

    Ok(config)
}
