use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use identity_controller_core::{
    retrieval::{AssignmentLookup, ResolveError, Resolver},
    AcquireError, Dispatcher, SecretStore, Token, TokenIssuer,
};
use serde::Serialize;
use std::{net::IpAddr, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

const TOKEN_PATH: &str = "/metadata/identity/oauth2/token";
const HOST_TOKEN_PATH: &str = "/host/token";
const INSTANCE_METADATA_PATH: &str = "/metadata/instance";

type Body = Full<Bytes>;

/// Resolves a request's source address to the workload it came from.
#[async_trait::async_trait]
pub trait WorkloadResolver: Send + Sync {
    async fn workload_by_ip(&self, ip: IpAddr) -> anyhow::Result<Option<(String, String)>>;
}

/// Response on the host path, which also reports which identity was
/// matched.
#[derive(Serialize)]
struct HostTokenResponse {
    token: Token,
    #[serde(rename = "clientid")]
    client_id: String,
}

pub struct Broker<R, L, I, S> {
    workloads: R,
    resolver: Resolver<L>,
    dispatcher: Dispatcher<I, S>,
    block_instance_metadata: bool,
    shutdown: drain::Watch,
}

impl<R, L, I, S> Broker<R, L, I, S>
where
    R: WorkloadResolver + 'static,
    L: AssignmentLookup + 'static,
    I: TokenIssuer + 'static,
    S: SecretStore + 'static,
{
    pub fn new(
        workloads: R,
        resolver: Resolver<L>,
        dispatcher: Dispatcher<I, S>,
        block_instance_metadata: bool,
        shutdown: drain::Watch,
    ) -> Self {
        Self {
            workloads,
            resolver,
            dispatcher,
            block_instance_metadata,
            shutdown,
        }
    }

    /// Accepts connections until shutdown is signaled.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "token broker listening");

        let shutdown = self.shutdown.clone();
        let mut signaled = std::pin::pin!(shutdown.signaled());
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let broker = self.clone();
                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(move |req| {
                            let broker = broker.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(
                                    broker.handle(peer.ip(), req).await,
                                )
                            }
                        });
                        let conn = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service);
                        if let Err(error) = conn.await {
                            tracing::debug!(%error, "connection failed");
                        }
                    });
                }
                _ = &mut signaled => {
                    tracing::info!("token broker shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Routes one request. Anything that is not a known endpoint is
    /// refused here; the broker never forwards traffic it does not
    /// understand.
    pub async fn handle<B>(&self, remote: IpAddr, req: Request<B>) -> Response<Body> {
        let path = req.uri().path().trim_end_matches('/');
        tracing::debug!(%remote, method = %req.method(), path, "handling request");

        match path {
            TOKEN_PATH => self.workload_token(remote, &req).await,
            HOST_TOKEN_PATH => self.host_token(remote, &req).await,
            INSTANCE_METADATA_PATH if self.block_instance_metadata => text(
                StatusCode::FORBIDDEN,
                "instance metadata requests are blocked",
            ),
            _ => text(StatusCode::NOT_FOUND, "unknown endpoint"),
        }
    }

    /// The workload path: the caller is identified by its source address.
    async fn workload_token<B>(&self, remote: IpAddr, req: &Request<B>) -> Response<Body> {
        let Some(resource) = query_param(req, "resource") else {
            return text(StatusCode::BAD_REQUEST, "parameter resource cannot be empty");
        };
        let client_id = query_param(req, "client_id");

        let (namespace, name) = match self.workloads.workload_by_ip(remote).await {
            Ok(Some(workload)) => workload,
            Ok(None) => {
                // The redirector sent traffic from something the registry
                // does not know. Never pass it through.
                tracing::error!(%remote, "source address does not resolve to a workload");
                return text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request source address does not resolve to a workload",
                );
            }
            Err(error) => {
                tracing::error!(%remote, %error, "workload lookup failed");
                return text(StatusCode::INTERNAL_SERVER_ERROR, "workload lookup failed");
            }
        };

        match self
            .issue(&namespace, &name, client_id.as_deref(), &resource)
            .await
        {
            Ok((token, _)) => json(&token),
            Err(response) => response,
        }
    }

    /// The host path: a node-local caller names the workload explicitly.
    async fn host_token<B>(&self, remote: IpAddr, req: &Request<B>) -> Response<Body> {
        if !remote.is_loopback() {
            tracing::error!(%remote, "host token request from a non-host address");
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request remote address is not from a host",
            );
        }

        let namespace = header(req, "podns");
        let name = header(req, "podname");
        let (Some(namespace), Some(name)) = (namespace, name) else {
            return text(
                StatusCode::BAD_REQUEST,
                "missing `podns` and `podname` from request header",
            );
        };
        let Some(resource) = query_param(req, "resource") else {
            return text(StatusCode::BAD_REQUEST, "parameter resource cannot be empty");
        };
        let client_id = query_param(req, "client_id");

        match self
            .issue(&namespace, &name, client_id.as_deref(), &resource)
            .await
        {
            Ok((token, client_id)) => json(&HostTokenResponse { token, client_id }),
            Err(response) => response,
        }
    }

    /// Resolution then acquisition, with the error taxonomy mapped onto
    /// response statuses: entitlement failures are terminal (403),
    /// pending provisioning is retryable (404), and cancellation is
    /// neither (503).
    async fn issue(
        &self,
        namespace: &str,
        name: &str,
        client_id: Option<&str>,
        resource: &str,
    ) -> Result<(Token, String), Response<Body>> {
        let shutdown = self.shutdown.clone();
        let cancel = async move {
            drop(shutdown.signaled().await);
        };

        let identity = self
            .resolver
            .resolve(namespace, name, client_id, cancel)
            .await
            .map_err(|error| {
                tracing::warn!(workload = %format_args!("{namespace}/{name}"), %error, "resolution failed");
                let status = match error {
                    ResolveError::NotEntitled { .. } => StatusCode::FORBIDDEN,
                    ResolveError::Pending { .. } => StatusCode::NOT_FOUND,
                    ResolveError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                };
                text(status, &error.to_string())
            })?;

        let resolved_client_id = identity.spec.client_id.clone();
        let token = self
            .dispatcher
            .acquire(&identity, client_id, resource)
            .await
            .map_err(|error| {
                tracing::error!(
                    workload = %format_args!("{namespace}/{name}"),
                    identity = %format_args!("{}/{}", identity.namespace, identity.name),
                    %error,
                    "token acquisition failed"
                );
                let status = match error {
                    AcquireError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                    AcquireError::Secret { .. } | AcquireError::Issuer(_) => StatusCode::FORBIDDEN,
                };
                text(status, &error.to_string())
            })?;

        Ok((token, resolved_client_id))
    }
}

fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn text(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!("{message}\n")))
        .expect("static response must build")
}

fn json<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("static response must build"),
        Err(error) => {
            tracing::error!(%error, "failed to encode response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_controller_core::retrieval::{PhasedIdentities, RetryBudget};
    use identity_controller_k8s_api::{CloudIdentitySpec, IdentityRef, IdentityType, SecretRef};
    use std::collections::BTreeMap;
    use tokio::time::Duration;

    struct StaticWorkloads(Option<(String, String)>);

    #[async_trait::async_trait]
    impl WorkloadResolver for StaticWorkloads {
        async fn workload_by_ip(&self, _ip: IpAddr) -> anyhow::Result<Option<(String, String)>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Clone, Default)]
    struct StaticLookup(PhasedIdentities);

    #[async_trait::async_trait]
    impl AssignmentLookup for StaticLookup {
        async fn workload_identities(
            &self,
            _ns: &str,
            _name: &str,
        ) -> anyhow::Result<PhasedIdentities> {
            Ok(self.0.clone())
        }
    }

    struct StaticIssuer;

    #[async_trait::async_trait]
    impl TokenIssuer for StaticIssuer {
        async fn user_assigned_token(
            &self,
            _client_id: &str,
            resource: &str,
        ) -> anyhow::Result<Token> {
            Ok(Token {
                access_token: "tok".to_string(),
                resource: resource.to_string(),
                token_type: "Bearer".to_string(),
                ..Default::default()
            })
        }

        async fn service_principal_token(
            &self,
            _tenant_id: &str,
            _client_id: &str,
            _secret: &str,
            _resource: &str,
        ) -> anyhow::Result<Token> {
            anyhow::bail!("not used")
        }

        async fn certificate_token(
            &self,
            _tenant_id: &str,
            _client_id: &str,
            _certificate: &[u8],
            _passphrase: &str,
            _resource: &str,
        ) -> anyhow::Result<Token> {
            anyhow::bail!("not used")
        }
    }

    struct NoSecrets;

    #[async_trait::async_trait]
    impl SecretStore for NoSecrets {
        async fn secret_data(
            &self,
            _secret: &SecretRef,
        ) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
            anyhow::bail!("not used")
        }
    }

    fn identity(client_id: &str) -> IdentityRef {
        IdentityRef {
            namespace: "ns".to_string(),
            name: "id-a".to_string(),
            spec: CloudIdentitySpec {
                identity_type: IdentityType::UserAssigned,
                resource_id: Some("/subscriptions/s/id-a".to_string()),
                client_id: client_id.to_string(),
                tenant_id: None,
                secret_ref: None,
            },
        }
    }

    fn broker(
        workload: Option<(&str, &str)>,
        buckets: PhasedIdentities,
    ) -> (
        Broker<StaticWorkloads, StaticLookup, StaticIssuer, NoSecrets>,
        drain::Signal,
    ) {
        let (signal, watch) = drain::channel();
        let budget = RetryBudget {
            created_attempts: 1,
            assigned_attempts: 1,
            poll_interval: Duration::from_millis(1),
        };
        let broker = Broker::new(
            StaticWorkloads(workload.map(|(ns, n)| (ns.to_string(), n.to_string()))),
            Resolver::new(StaticLookup(buckets), budget, false),
            Dispatcher::new(StaticIssuer, NoSecrets),
            true,
            watch,
        );
        (broker, signal)
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    fn pod_ip() -> IpAddr {
        "10.0.0.12".parse().unwrap()
    }

    fn assigned(client_id: &str) -> PhasedIdentities {
        PhasedIdentities {
            assigned: vec![identity(client_id)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn token_requires_resource_param() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let rsp = broker
            .handle(pod_ip(), get("/metadata/identity/oauth2/token"))
            .await;
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_source_is_a_hard_error() {
        let (broker, _signal) = broker(None, assigned("c1"));
        let rsp = broker
            .handle(
                pod_ip(),
                get("/metadata/identity/oauth2/token?resource=https%3A%2F%2Fvault"),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn entitled_workload_receives_a_token() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let rsp = broker
            .handle(
                pod_ip(),
                get("/metadata/identity/oauth2/token?resource=https%3A%2F%2Fvault"),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unentitled_workload_is_forbidden() {
        let (broker, _signal) = broker(Some(("ns", "w1")), PhasedIdentities::default());
        let rsp = broker
            .handle(
                pod_ip(),
                get("/metadata/identity/oauth2/token?resource=https%3A%2F%2Fvault"),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn pending_assignment_maps_to_not_found() {
        let (broker, _signal) = broker(
            Some(("ns", "w1")),
            PhasedIdentities {
                created: vec![identity("c1")],
                ..Default::default()
            },
        );
        let rsp = broker
            .handle(
                pod_ip(),
                get("/metadata/identity/oauth2/token?resource=https%3A%2F%2Fvault"),
            )
            .await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn host_path_requires_a_host_caller() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let rsp = broker
            .handle(pod_ip(), get("/host/token?resource=r1"))
            .await;
        assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn host_path_names_the_workload_in_headers() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let localhost: IpAddr = "127.0.0.1".parse().unwrap();

        let missing = broker.handle(localhost, get("/host/token?resource=r1")).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri("/host/token?resource=r1")
            .header("podns", "ns")
            .header("podname", "w1")
            .body(())
            .unwrap();
        let rsp = broker.handle(localhost, req).await;
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instance_metadata_is_blocked() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let rsp = broker.handle(pod_ip(), get("/metadata/instance")).await;
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_paths_are_refused() {
        let (broker, _signal) = broker(Some(("ns", "w1")), assigned("c1"));
        let rsp = broker.handle(pod_ip(), get("/latest/meta-data")).await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }
}
