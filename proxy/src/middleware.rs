use async_trait::async_trait;
use hyper::StatusCode;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::errors::ProxyError;
use crate::types::CasperResponse;

/// One stage of the request pipeline. Implementations declare any subset of
/// the three phases; the defaults are pass-through.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the upstream forwarder. Returning a response
    /// short-circuits the rest of the chain.
    async fn on_request(
        &self,
        _ctx: &mut RequestContext,
    ) -> Result<Option<CasperResponse>, ProxyError> {
        Ok(None)
    }

    /// Runs on the way back out, in reverse declaration order.
    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &mut CasperResponse,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Runs after the response bytes have been flushed to the client.
    /// Errors are caught and logged, never surfaced.
    async fn after_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &CasperResponse,
    ) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Produces the response when no middleware short-circuits.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, ctx: &mut RequestContext) -> CasperResponse;
}

pub struct ChainOutcome {
    pub response: CasperResponse,
    /// How many middlewares saw `on_request`; the same prefix gets
    /// `after_response`.
    pub ran: usize,
}

/// The configured, ordered middleware chain.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        MiddlewareChain { middlewares }
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `on_request` in declared order and `on_response` in reverse from
    /// the point the response was produced. The first middleware returning a
    /// response wins; otherwise the forwarder supplies it.
    pub async fn run(&self, ctx: &mut RequestContext, forwarder: &dyn Forwarder) -> ChainOutcome {
        let mut produced: Option<(usize, CasperResponse)> = None;
        let mut ran = 0;

        for (index, middleware) in self.middlewares.iter().enumerate() {
            ran = index + 1;
            match middleware.on_request(ctx).await {
                Ok(None) => {}
                Ok(Some(response)) => {
                    produced = Some((index, response));
                    break;
                }
                Err(e) => {
                    tracing::error!("Middleware {} failed: {e}", middleware.name());
                    produced = Some((index, error_response(&e)));
                    break;
                }
            }
        }

        let (from, mut response) = match produced {
            Some((index, response)) => (index + 1, response),
            None => (self.middlewares.len(), forwarder.forward(ctx).await),
        };

        for middleware in self.middlewares[..from].iter().rev() {
            if let Err(e) = middleware.on_response(ctx, &mut response).await {
                tracing::error!("Middleware {} on_response failed: {e}", middleware.name());
                response = error_response(&e);
            }
        }

        ChainOutcome { response, ran }
    }

    /// Runs `after_response` in declared order for the prefix whose
    /// `on_request` ran. Failures are logged only.
    pub async fn run_after_response(
        &self,
        ctx: &mut RequestContext,
        response: &CasperResponse,
        ran: usize,
    ) {
        for middleware in &self.middlewares[..ran.min(self.middlewares.len())] {
            if let Err(e) = middleware.after_response(ctx, response).await {
                tracing::error!(
                    "Middleware {} after_response failed: {e}",
                    middleware.name()
                );
            }
        }
    }
}

fn error_response(error: &ProxyError) -> CasperResponse {
    CasperResponse::synthetic(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::test_context;
    use bytes::Bytes;
    use http::header::HeaderMap;
    use hyper::Method;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        short_circuit: bool,
        fail_on_request: bool,
        fail_after_response: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: Log) -> Self {
            Recorder {
                name,
                log,
                short_circuit: false,
                fail_on_request: false,
                fail_after_response: false,
            }
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_request(
            &self,
            _ctx: &mut RequestContext,
        ) -> Result<Option<CasperResponse>, ProxyError> {
            self.log.lock().push(format!("{}:on_request", self.name));
            if self.fail_on_request {
                return Err(ProxyError::InternalError(format!("{} broke", self.name)));
            }
            if self.short_circuit {
                return Ok(Some(CasperResponse::cached(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from_static(b"short"),
                )));
            }
            Ok(None)
        }

        async fn on_response(
            &self,
            _ctx: &mut RequestContext,
            _response: &mut CasperResponse,
        ) -> Result<(), ProxyError> {
            self.log.lock().push(format!("{}:on_response", self.name));
            Ok(())
        }

        async fn after_response(
            &self,
            _ctx: &mut RequestContext,
            _response: &CasperResponse,
        ) -> Result<(), ProxyError> {
            self.log
                .lock()
                .push(format!("{}:after_response", self.name));
            if self.fail_after_response {
                return Err(ProxyError::InternalError("late failure".to_string()));
            }
            Ok(())
        }
    }

    struct StubForwarder {
        log: Log,
    }

    #[async_trait]
    impl Forwarder for StubForwarder {
        async fn forward(&self, _ctx: &mut RequestContext) -> CasperResponse {
            self.log.lock().push("forward".to_string());
            CasperResponse::proxied(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"up"))
        }
    }

    fn chain_of(middlewares: Vec<Recorder>) -> MiddlewareChain {
        MiddlewareChain::new(
            middlewares
                .into_iter()
                .map(|m| Arc::new(m) as Arc<dyn Middleware>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_full_pass_through_ordering() {
        let log: Log = Default::default();
        let chain = chain_of(vec![
            Recorder::new("a", log.clone()),
            Recorder::new("b", log.clone()),
        ]);
        let mut ctx = test_context(Method::GET, "/x", HeaderMap::new());
        let forwarder = StubForwarder { log: log.clone() };

        let outcome = chain.run(&mut ctx, &forwarder).await;
        assert_eq!(outcome.ran, 2);
        assert!(outcome.response.is_proxied());

        chain
            .run_after_response(&mut ctx, &outcome.response, outcome.ran)
            .await;

        assert_eq!(
            *log.lock(),
            vec![
                "a:on_request",
                "b:on_request",
                "forward",
                "b:on_response",
                "a:on_response",
                "a:after_response",
                "b:after_response",
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_upstream_and_later_middlewares() {
        let log: Log = Default::default();
        let mut second = Recorder::new("b", log.clone());
        second.short_circuit = true;
        let chain = chain_of(vec![
            Recorder::new("a", log.clone()),
            second,
            Recorder::new("c", log.clone()),
        ]);
        let mut ctx = test_context(Method::GET, "/x", HeaderMap::new());
        let forwarder = StubForwarder { log: log.clone() };

        let outcome = chain.run(&mut ctx, &forwarder).await;
        assert_eq!(outcome.ran, 2);
        assert!(outcome.response.is_cached());

        chain
            .run_after_response(&mut ctx, &outcome.response, outcome.ran)
            .await;

        // c never ran; on_response walks back from the short-circuit point;
        // after_response runs for everything whose on_request was invoked
        assert_eq!(
            *log.lock(),
            vec![
                "a:on_request",
                "b:on_request",
                "b:on_response",
                "a:on_response",
                "a:after_response",
                "b:after_response",
            ]
        );
    }

    #[tokio::test]
    async fn test_on_request_error_becomes_500() {
        let log: Log = Default::default();
        let mut first = Recorder::new("a", log.clone());
        first.fail_on_request = true;
        let chain = chain_of(vec![first, Recorder::new("b", log.clone())]);
        let mut ctx = test_context(Method::GET, "/x", HeaderMap::new());
        let forwarder = StubForwarder { log: log.clone() };

        let outcome = chain.run(&mut ctx, &forwarder).await;
        assert_eq!(outcome.response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            outcome.response.body,
            Bytes::from_static(b"Internal error: a broke")
        );
        assert!(!log.lock().contains(&"forward".to_string()));
    }

    #[tokio::test]
    async fn test_after_response_errors_are_swallowed() {
        let log: Log = Default::default();
        let mut first = Recorder::new("a", log.clone());
        first.fail_after_response = true;
        let chain = chain_of(vec![first, Recorder::new("b", log.clone())]);
        let mut ctx = test_context(Method::GET, "/x", HeaderMap::new());
        let forwarder = StubForwarder { log: log.clone() };

        let outcome = chain.run(&mut ctx, &forwarder).await;
        chain
            .run_after_response(&mut ctx, &outcome.response, outcome.ran)
            .await;

        // Both after_response hooks ran despite the first failing
        let entries = log.lock();
        assert!(entries.contains(&"a:after_response".to_string()));
        assert!(entries.contains(&"b:after_response".to_string()));
    }

    #[tokio::test]
    async fn test_empty_chain_just_forwards() {
        let log: Log = Default::default();
        let chain = MiddlewareChain::new(vec![]);
        let mut ctx = test_context(Method::GET, "/x", HeaderMap::new());
        let forwarder = StubForwarder { log: log.clone() };

        let outcome = chain.run(&mut ctx, &forwarder).await;
        assert_eq!(outcome.ran, 0);
        assert!(outcome.response.is_proxied());
        assert_eq!(*log.lock(), vec!["forward"]);
    }
}
