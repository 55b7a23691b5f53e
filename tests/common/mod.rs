//! A shared, in-memory `RpcClient` test double. Not itself a test binary —
//! included by `mod common;` from the integration tests that need it.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use ps_communicator::{RpcClient, Scope, Status, Variable, STATUS_OK};

/// A single shared "server": one `Scope` per simulated pserver endpoint,
/// plus barrier-call counters so tests can assert on RPC fan-out without
/// a real transport.
#[derive(Default)]
pub struct FakeRpcClient {
    server: DashMap<String, Scope>,
    pub batch_barrier_calls: AtomicUsize,
    pub fetch_barrier_calls: AtomicUsize,
}

impl FakeRpcClient {
    pub fn new() -> Self {
        FakeRpcClient::default()
    }

    pub fn seed(&self, endpoint: &str, name: &str, var: Variable) {
        self.server.entry(endpoint.to_string()).or_insert_with(Scope::new).set(name, var);
    }

    pub fn get(&self, endpoint: &str, name: &str) -> Option<Variable> {
        self.server.get(endpoint).and_then(|s| s.get(name).map(|v| (*v).clone()))
    }
}

#[async_trait]
impl RpcClient for FakeRpcClient {
    async fn async_send_var(&self, endpoint: &str, scope: &Scope, name: &str) -> Status {
        let var = match scope.get(name) {
            Some(v) => (*v).clone(),
            None => return 1,
        };
        self.server.entry(endpoint.to_string()).or_insert_with(Scope::new).set(name, var);
        STATUS_OK
    }

    async fn async_get_var(
        &self,
        endpoint: &str,
        scope: &Scope,
        _in_name: &str,
        out_name: &str,
        alias: &str,
    ) -> Status {
        match self.get(endpoint, out_name) {
            Some(v) => {
                scope.set(alias, v);
                STATUS_OK
            }
            None => 2,
        }
    }

    async fn async_send_batch_barrier(&self, _endpoint: &str) -> Status {
        self.batch_barrier_calls.fetch_add(1, Ordering::SeqCst);
        STATUS_OK
    }

    async fn async_send_fetch_barrier(&self, _endpoint: &str) -> Status {
        self.fetch_barrier_calls.fetch_add(1, Ordering::SeqCst);
        STATUS_OK
    }
}
