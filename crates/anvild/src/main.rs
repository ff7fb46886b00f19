//! anvild - resource compilation server daemon
//!
//! Loads ini settings, wires the built-in type and compiler registries, and
//! runs the server loop until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anvil_proto::ResourceTypeId;
use anvild::registry::{StaticCompilerRegistry, TableCompiler, TypeRegistry};
use anvild::server::{Collaborators, ResourceServer};
use anvild::settings::ServerSettings;
use camino::Utf8PathBuf;
use eyre::Result;

/// The resource types the stock engine modules ship. A real game wires its
/// own registries here; every registered type gets a pass-through compiler
/// entry so packaging can traverse it.
fn builtin_collaborators() -> Collaborators {
    let mut types = TypeRegistry::default();
    let mut compilers = StaticCompilerRegistry::default();

    for tag in ["msh", "smsh", "tex", "mat", "anim", "skel", "phys"] {
        if let Some(type_id) = ResourceTypeId::from_tag(tag) {
            types.register_resource_type(type_id);
            compilers.register(type_id, Box::new(TableCompiler::default()));
        }
    }

    types.register_entity_descriptor_type(ResourceTypeId::MAP);
    compilers.register(ResourceTypeId::MAP, Box::new(TableCompiler::default()));
    if let Some(type_id) = ResourceTypeId::from_tag("ec") {
        types.register_entity_descriptor_type(type_id);
    }

    Collaborators {
        type_registry: types,
        compiler_registry: Arc::new(compilers),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("anvild=info")),
        )
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(Utf8PathBuf::from)
        .or_else(|| std::env::var("ANVIL_SETTINGS").ok().map(Utf8PathBuf::from))
        .unwrap_or_else(|| Utf8PathBuf::from("anvil.ini"));

    tracing::info!("Starting anvild");
    tracing::info!("  settings: {}", settings_path);

    let settings = ServerSettings::load(&settings_path)?;
    let mut server = ResourceServer::initialize(settings, builtin_collaborators()).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(16));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => server.update().await,
        }
    }

    server.shutdown().await;
    Ok(())
}
