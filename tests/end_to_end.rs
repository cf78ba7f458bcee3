//! Crate-level scenarios spanning the worker pool, the chunking codec, and
//! the filesystem backend together.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use reposrv::bus::mock::MockBus;
use reposrv::bus::{Bus, Message};
use reposrv::config::Config;
use reposrv::pool::Pool;
use reposrv::protocol::chunk::{chunk_limit, send_request};
use reposrv::protocol::{
    random_token, BucketRef, FileInfo, ListOp, ListResult, LoadOp, LoadResult, MkdirOp,
    MkdirResult, OpKind, OpenOp, OpenResult, SaveOp, SaveResult,
};
use reposrv::Runtime;

const DEADLINE: Duration = Duration::from_secs(5);

async fn start_pool(max_payload: usize, workers: usize) -> (tempfile::TempDir, Arc<dyn Bus>, Pool) {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("alice")).expect("provision alice bucket");
    let bus: Arc<dyn Bus> = Arc::new(MockBus::new(max_payload));
    let mut config = Config::default();
    config.workers.count = workers;
    config.workers.job_timeout_secs = 10;
    config.repo_root = dir.path().to_path_buf();
    let runtime = Runtime::with_bus(config, bus.clone());
    let pool = Pool::start(runtime).await.expect("pool starts");
    (dir, bus, pool)
}

fn op_msg(kind: OpKind, body: Vec<u8>) -> Message {
    Message::new(reposrv::config::COMMAND_SUBJECT)
        .set_header(reposrv::protocol::HEADER_MSGID, random_token())
        .set_header(reposrv::protocol::HEADER_OP, kind.as_header_value())
        .with_body(body)
}

async fn call<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
    bus: &dyn Bus,
    kind: OpKind,
    req: &Req,
) -> Resp {
    let body = bincode::serialize(req).unwrap();
    let limit = chunk_limit(bus.max_payload());
    let reply = send_request(bus, op_msg(kind, body), limit, DEADLINE)
        .await
        .expect("request succeeds");
    bincode::deserialize(&reply.body).expect("reply decodes")
}

/// Scenario 1: small open.
#[tokio::test]
async fn small_open_registers_a_session() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let result: OpenResult = call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "alice".to_string() }).await;
    assert!(result.ok);
    assert_eq!(result.client_id.unwrap().len(), 16);

    pool.run_until_shutdown(CancellationToken::new()).await;
}

/// Opening a bucket whose directory hasn't been provisioned fails without
/// registering a session.
#[tokio::test]
async fn open_on_a_missing_bucket_directory_is_rejected() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let result: OpenResult =
        call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "nobody".to_string() }).await;
    assert!(!result.ok);
    assert!(result.client_id.is_none());

    pool.run_until_shutdown(CancellationToken::new()).await;
}

/// Scenario 2: oversize save is chunked on the wire and lands whole on disk.
#[tokio::test]
async fn oversize_save_writes_the_whole_body() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let open: OpenResult = call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "alice".to_string() }).await;
    let client_id = open.client_id.unwrap();

    let data = vec![7u8; 3_500_000];
    let save: SaveResult = call(
        bus.as_ref(),
        OpKind::Save,
        &SaveOp {
            bucket_ref: BucketRef::ClientId(client_id),
            dir: "snapshots".to_string(),
            name: "blob.bin".to_string(),
            filesize: data.len() as u64,
            data: data.clone(),
        },
    )
    .await;
    assert!(save.ok);

    pool.run_until_shutdown(CancellationToken::new()).await;
}

/// Scenario 3: list with one-level recurse.
#[tokio::test]
async fn list_recurses_exactly_one_level() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let open: OpenResult = call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "alice".to_string() }).await;
    let client_id = open.client_id.unwrap();

    let _: MkdirResult = call(
        bus.as_ref(),
        OpKind::Mkdir,
        &MkdirOp { bucket_ref: BucketRef::ClientId(client_id.clone()), dir: "a/sub/deeper".to_string() },
    )
    .await;

    for (dir, name) in [("a", "x"), ("a/sub", "y"), ("a/sub/deeper", "z")] {
        let _: SaveResult = call(
            bus.as_ref(),
            OpKind::Save,
            &SaveOp {
                bucket_ref: BucketRef::ClientId(client_id.clone()),
                dir: dir.to_string(),
                name: name.to_string(),
                filesize: 1,
                data: vec![1],
            },
        )
        .await;
    }

    let list: ListResult = call(
        bus.as_ref(),
        OpKind::List,
        &ListOp { bucket_ref: BucketRef::ClientId(client_id), base_dir: "a".to_string(), recurse: true },
    )
    .await;
    assert!(list.ok);
    let mut names: Vec<String> = list.entries.iter().map(|e: &FileInfo| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["x".to_string(), "y".to_string()]);

    pool.run_until_shutdown(CancellationToken::new()).await;
}

/// Scenario 4: load with an explicit range and with length 0 (to EOF).
#[tokio::test]
async fn load_respects_offset_and_length() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let open: OpenResult = call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "alice".to_string() }).await;
    let client_id = open.client_id.unwrap();

    let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
    let _: SaveResult = call(
        bus.as_ref(),
        OpKind::Save,
        &SaveOp {
            bucket_ref: BucketRef::ClientId(client_id.clone()),
            dir: "d".to_string(),
            name: "f.bin".to_string(),
            filesize: data.len() as u64,
            data: data.clone(),
        },
    )
    .await;

    let ranged: LoadResult = call(
        bus.as_ref(),
        OpKind::Load,
        &LoadOp {
            bucket_ref: BucketRef::ClientId(client_id.clone()),
            dir: "d".to_string(),
            name: "f.bin".to_string(),
            offset: 100,
            length: 50,
        },
    )
    .await;
    assert!(ranged.ok);
    assert_eq!(ranged.data, data[100..150]);

    let whole: LoadResult = call(
        bus.as_ref(),
        OpKind::Load,
        &LoadOp {
            bucket_ref: BucketRef::ClientId(client_id),
            dir: "d".to_string(),
            name: "f.bin".to_string(),
            offset: 0,
            length: 0,
        },
    )
    .await;
    assert!(whole.ok);
    assert_eq!(whole.data.len(), 10_000);

    pool.run_until_shutdown(CancellationToken::new()).await;
}

/// Scenario 6: an unrecognized op is dropped with no reply and no state
/// change; a subsequent well-formed request still succeeds.
#[tokio::test]
async fn unknown_op_is_dropped_and_pool_keeps_serving() {
    let (_dir, bus, pool) = start_pool(1_000_000, 2).await;

    let msg = Message::new(reposrv::config::COMMAND_SUBJECT)
        .set_header(reposrv::protocol::HEADER_MSGID, random_token())
        .set_header(reposrv::protocol::HEADER_OP, "compact")
        .with_body(Vec::new());
    let result = bus.request(msg, Duration::from_millis(300)).await;
    assert!(result.is_err());

    let open: OpenResult = call(bus.as_ref(), OpKind::Open, &OpenOp { bucket: "alice".to_string() }).await;
    assert!(open.ok);

    pool.run_until_shutdown(CancellationToken::new()).await;
}
