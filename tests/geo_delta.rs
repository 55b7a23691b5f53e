//! S4: GEO's delta-based sparse and dense sync paths, including the
//! `geo_dense_early_return_bug` compatibility flag.

mod common;

use std::collections::HashMap;

use common::FakeRpcClient;
use ps_communicator::geo::{GeoEngine, SparseIdQueue};
use ps_communicator::{BoundedQueue, HandlerKind, MergeMode, Scope, Variable, VariableContext};

fn ctx(name: &str) -> VariableContext {
    VariableContext {
        name: name.to_string(),
        shard_names: vec![name.to_string()],
        endpoints: vec!["pserver0:1000".to_string()],
        height_sections: vec![],
        origin_names: vec![],
        trainer_id: 0,
        merge_mode: MergeMode::Add,
        handler_kind: HandlerKind::Send,
        is_sparse: true,
    }
}

#[tokio::test]
async fn send_sparse_computes_delta_scaled_by_trainers() {
    // 2 trainers, local row 3 has drifted from an all-zero shadow by
    // [4.0, 4.0]; the sent delta must be [2.0, 2.0] (divided by trainers).
    let mut queues = HashMap::new();
    queues.insert("emb".to_string(), SparseIdQueue { ctx: ctx("emb"), ids: BoundedQueue::new(16) });
    let engine = GeoEngine::new(2, vec![], queues, false);
    engine.touch_sparse_row("emb", 3);

    let local = Scope::new();
    local.set("emb", Variable::sparse_row(10, vec![3], 2, vec![4.0, 4.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    engine.send_sparse(&rpc, "emb", &local, &send_scope).await.unwrap();

    let sent = rpc.get("pserver0:1000", "emb").expect("delta sent");
    match sent {
        Variable::SparseRow { rows, data, .. } => {
            assert_eq!(rows, vec![3]);
            assert_eq!(data, vec![2.0, 2.0]);
        }
        _ => panic!("expected sparse"),
    }
}

#[tokio::test]
async fn send_sparse_is_noop_when_nothing_touched() {
    let mut queues = HashMap::new();
    queues.insert("emb".to_string(), SparseIdQueue { ctx: ctx("emb"), ids: BoundedQueue::new(16) });
    let engine = GeoEngine::new(2, vec![], queues, false);

    let local = Scope::new();
    local.set("emb", Variable::sparse_row(10, vec![3], 2, vec![4.0, 4.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    engine.send_sparse(&rpc, "emb", &local, &send_scope).await.unwrap();
    assert!(rpc.get("pserver0:1000", "emb").is_none());
}

#[tokio::test]
async fn send_dense_suppressed_when_bug_flag_set() {
    let engine = GeoEngine::new(2, vec![], HashMap::new(), true);
    let local = Scope::new();
    local.set("dense_w", Variable::dense(vec![2], vec![4.0, 4.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    let sent = engine.send_dense(&rpc, &ctx("dense_w"), &local, &send_scope).await.unwrap();
    assert!(!sent, "dense send must be suppressed when the compatibility flag is set");
    assert!(rpc.get("pserver0:1000", "dense_w").is_none());
}

#[tokio::test]
async fn recv_sparse_applies_additive_delta_not_overwrite() {
    // S4 literal: trainers=4, emb width 2. latest[3]=[1,1], shadow[3]=[0,0].
    let mut queues = HashMap::new();
    queues.insert("emb".to_string(), SparseIdQueue { ctx: ctx("emb"), ids: BoundedQueue::new(16) });
    let engine = GeoEngine::new(4, vec![], queues, false);
    engine.touch_sparse_row("emb", 3);

    let local = Scope::new();
    local.set("emb", Variable::sparse_row(10, vec![3], 2, vec![1.0, 1.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    engine.send_sparse(&rpc, "emb", &local, &send_scope).await.unwrap();
    let sent = rpc.get("pserver0:1000", "emb").expect("delta sent");
    match sent {
        Variable::SparseRow { data, .. } => assert_eq!(data, vec![0.25, 0.25]),
        _ => panic!("expected sparse"),
    }

    // Server responds with its own post-merge value for row 3.
    rpc.seed("pserver0:1000", "emb", Variable::sparse_row(10, vec![3], 2, vec![0.5, 0.5]));
    let pserver_scope = Scope::new();
    engine.recv_sparse(&rpc, &ctx("emb"), &local, &pserver_scope).await.unwrap();

    let updated = local.get("emb").unwrap();
    match &*updated {
        Variable::SparseRow { rows, data, .. } => {
            assert_eq!(rows, &vec![3]);
            // latest[3] = 1.0 + (0.5 - 0.25) = 1.25, not a bare overwrite to 0.5.
            assert_eq!(data, &vec![1.25, 1.25]);
        }
        _ => panic!("expected sparse"),
    }
}

#[tokio::test]
async fn send_dense_sends_delta_when_bug_flag_unset() {
    let engine = GeoEngine::new(2, vec![], HashMap::new(), false);
    let local = Scope::new();
    local.set("dense_w", Variable::dense(vec![2], vec![6.0, 6.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    let sent = engine.send_dense(&rpc, &ctx("dense_w"), &local, &send_scope).await.unwrap();
    assert!(sent);
    let got = rpc.get("pserver0:1000", "dense_w").expect("dense delta sent");
    match got {
        Variable::Dense { data, .. } => assert_eq!(data, vec![3.0, 3.0]),
        _ => panic!("expected dense"),
    }
}

#[tokio::test]
async fn recv_dense_applies_additive_delta_not_overwrite() {
    // trainers=2, old shadow starts at 0: local drifts to [6,6], so
    // send_dense's delta is [3,3] and the shadow becomes [3,3]. The server
    // answers with [5,5]; recv_dense must add (5-3)=2 to local's current
    // [6,6], landing on [8,8] — not overwrite it with the server's [5,5].
    let engine = GeoEngine::new(2, vec![], HashMap::new(), false);
    let local = Scope::new();
    local.set("dense_w", Variable::dense(vec![2], vec![6.0, 6.0]));
    let send_scope = Scope::new();
    let rpc = FakeRpcClient::new();

    engine.send_dense(&rpc, &ctx("dense_w"), &local, &send_scope).await.unwrap();

    rpc.seed("pserver0:1000", "dense_w", Variable::dense(vec![2], vec![5.0, 5.0]));
    let pserver_scope = Scope::new();
    engine.recv_dense(&rpc, &ctx("dense_w"), &local, &pserver_scope).await.unwrap();

    let updated = local.get("dense_w").unwrap();
    match &*updated {
        Variable::Dense { data, .. } => assert_eq!(data, &vec![8.0, 8.0]),
        _ => panic!("expected dense"),
    }
}

#[tokio::test]
async fn run_cycle_drives_every_registered_variable_concurrently() {
    let mut queues = HashMap::new();
    queues.insert("emb".to_string(), SparseIdQueue { ctx: ctx("emb"), ids: BoundedQueue::new(16) });
    let engine = GeoEngine::new(2, vec![ctx("dense_w")], queues, false);
    engine.touch_sparse_row("emb", 3);

    let local = Scope::new();
    local.set("emb", Variable::sparse_row(10, vec![3], 2, vec![2.0, 2.0]));
    local.set("dense_w", Variable::dense(vec![2], vec![4.0, 4.0]));
    let send_scope = Scope::new();
    let pserver_scope = Scope::new();
    let rpc = FakeRpcClient::new();
    rpc.seed("pserver0:1000", "emb", Variable::sparse_row(10, vec![3], 2, vec![1.0, 1.0]));
    rpc.seed("pserver0:1000", "dense_w", Variable::dense(vec![2], vec![2.0, 2.0]));

    engine.run_cycle(&rpc, &local, &send_scope, &pserver_scope).await.unwrap();

    assert!(local.get("emb").is_some());
    assert!(local.get("dense_w").is_some());
}
