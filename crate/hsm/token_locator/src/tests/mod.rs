#![allow(clippy::unwrap_used, clippy::panic_in_result_fn)]


mod test_admin;

use std::sync::Arc;

use crate::{ModuleLoader, SessionResolver, TokenConfig};

fn resolver_with(
    runtime: &Arc<mock::MockRuntime>,
    config: TokenConfig,
) -> (SessionResolver, Arc<mock::MockLoader>) {
    cosmian_logger::log_init(None);
    let loader = Arc::new(mock::MockLoader::new(runtime.clone()));
    let resolver = SessionResolver::new(loader.clone() as Arc<dyn ModuleLoader>, config);
    (resolver, loader)
}

fn resolver(runtime: &Arc<mock::MockRuntime>) -> (SessionResolver, Arc<mock::MockLoader>) {
    resolver_with(runtime, TokenConfig::default())
}
