//! S2/S3: HalfAsync's per-send barrier decrement, and Sync's batch/fetch
//! barrier bracketing around send/recv.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::FakeRpcClient;
use ps_communicator::{
    CommunicatorConfig, CommunicatorCore, HandlerKind, MergeMode, Mode, RecvPipeline, SendChannel, SendPipeline,
    Variable, VariableContext,
};

fn base_config(mode: Mode) -> CommunicatorConfig {
    let mut envs = HashMap::new();
    envs.insert("barrier_table_id".into(), "0".into());
    envs.insert("trainer_id".into(), "0".into());
    envs.insert("trainers".into(), "2".into());
    if mode == Mode::Sync {
        envs.insert("pserver_endpoints".into(), "pserver0:1000".into());
    }
    CommunicatorConfig::from_map(mode, &envs).unwrap()
}

fn dense_ctx(name: &str) -> VariableContext {
    VariableContext {
        name: name.to_string(),
        shard_names: vec![name.to_string()],
        endpoints: vec!["pserver0:1000".to_string()],
        height_sections: vec![],
        origin_names: vec![],
        trainer_id: 0,
        merge_mode: MergeMode::Average,
        handler_kind: HandlerKind::Send,
        is_sparse: false,
    }
}

#[tokio::test]
async fn half_async_cycle_sends_merges_and_decrements_barrier() {
    let config = base_config(Mode::HalfAsync);
    let rpc = Arc::new(FakeRpcClient::new());

    let mut channels = HashMap::new();
    channels.insert("w".to_string(), SendChannel::new(dense_ctx("w"), 10));
    let send = SendPipeline::new(channels, config.thread_pool_size);
    let recv = RecvPipeline::new(vec![dense_ctx("w")], config.thread_pool_size);

    let core = CommunicatorCore::new(config, send, recv, rpc.clone());
    core.push_batch("w", Variable::dense(vec![2], vec![1.0, 1.0]));
    core.end_batch();
    core.client_barrier.trigger_reset(1);

    core.run_cycle(&dense_ctx("@PS_STEP_COUNTER@"), 1).await.unwrap();

    let sent = rpc.get("pserver0:1000", "w").expect("w sent to pserver");
    match sent {
        Variable::Dense { data, .. } => assert_eq!(data, vec![1.0, 1.0]),
        _ => panic!("expected dense"),
    }

    let recvd = core.recv_scope.get("w").expect("w received back");
    match &*recvd {
        Variable::Dense { data, .. } => assert_eq!(data, &vec![1.0, 1.0]),
        _ => panic!("expected dense"),
    }

    assert_eq!(core.batches.get(), 0, "batch counter resets after a half-async cycle");
    assert_eq!(
        core.client_barrier.trigger(),
        0,
        "BarrierTriggerDecrement fires once per half-async cycle"
    );
}

#[tokio::test]
async fn half_async_barrier_releases_trainers_once_round_completes() {
    // S2: two trainers push two grads then call Barrier(); both must
    // return only after one send+recv cycle, with barrier_counter back
    // at 0.
    let config = base_config(Mode::HalfAsync);
    let rpc = Arc::new(FakeRpcClient::new());

    let mut channels = HashMap::new();
    channels.insert("w".to_string(), SendChannel::new(dense_ctx("w"), 10));
    let send = SendPipeline::new(channels, config.thread_pool_size);
    let recv = RecvPipeline::new(vec![dense_ctx("w")], config.thread_pool_size);

    let core = Arc::new(CommunicatorCore::new(config, send, recv, rpc.clone()));
    core.push_batch("w", Variable::dense(vec![2], vec![1.0, 1.0]));
    core.end_batch();
    core.push_batch("w", Variable::dense(vec![2], vec![3.0, 3.0]));
    core.end_batch();
    core.client_barrier.trigger_reset(2);

    let trainers: Vec<_> = (0..2)
        .map(|_| {
            let core = core.clone();
            std::thread::spawn(move || core.barrier())
        })
        .collect();

    // Give both trainers a chance to park in Barrier() before the round
    // runs and releases them.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    core.run_cycle(&dense_ctx("@PS_STEP_COUNTER@"), 2).await.unwrap();
    core.barrier_weak_up();

    for t in trainers {
        t.join().unwrap();
    }
    assert_eq!(core.client_barrier.counter(), 0);
}

#[tokio::test]
async fn sync_cycle_brackets_send_and_recv_with_barriers() {
    let config = base_config(Mode::Sync);
    let rpc = Arc::new(FakeRpcClient::new());

    let mut channels = HashMap::new();
    channels.insert("w".to_string(), SendChannel::new(dense_ctx("w"), 10));
    let send = SendPipeline::new(channels, config.thread_pool_size);
    let recv = RecvPipeline::new(vec![dense_ctx("w")], config.thread_pool_size);

    let core = CommunicatorCore::new(config, send, recv, rpc.clone());
    core.push_batch("w", Variable::dense(vec![2], vec![2.0, 2.0]));
    core.end_batch();

    core.run_cycle(&dense_ctx("@PS_STEP_COUNTER@"), 1).await.unwrap();

    assert_eq!(rpc.batch_barrier_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rpc.fetch_barrier_calls.load(Ordering::SeqCst), 1);
}
