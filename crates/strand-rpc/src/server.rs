//! Router and single-shot endpoint hosting.

use crate::diag;
use std::sync::Arc;
use strand_core::rpc::SingleShotHandle;
use strand_core::{NamespaceRouter, RouterHandle, RpcOptions, SingleShotServer};
use tracing::info;

/// Both listeners of a running `serve`.
pub struct Servers {
    pub router: RouterHandle,
    pub http: SingleShotHandle,
}

/// Start the persistent router on `rpc_port` and the single-shot endpoint on
/// `http_port`, both serving the built-in namespaces.
pub async fn start_servers(
    options: RpcOptions,
    host: &str,
    rpc_port: u16,
    http_port: u16,
) -> anyhow::Result<Servers> {
    let diag = Arc::new(diag::service(&options));

    let mut router = NamespaceRouter::new(options.clone());
    router.register_shared(diag.clone());
    let router = router.listen(format!("{}:{}", host, rpc_port)).await?;

    let mut single_shot = SingleShotServer::new(options);
    single_shot.register_service(diag);
    let http = single_shot.serve(format!("{}:{}", host, http_port)).await?;

    info!(
        "Serving namespace '{}' on rpc {} and http {}",
        diag::NAMESPACE,
        router.addr(),
        http.addr
    );
    Ok(Servers { router, http })
}
