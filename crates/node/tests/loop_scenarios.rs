//! End-to-end control-loop scenarios driven tick by tick.
//!
//! These tests run a full node against the in-memory transport, the
//! byte-level tokenizer, and the scripted engine, and assert on the exact
//! frames the dispatcher would observe.

use genloop_common::config::{NodeConfig, PromptFormat, StreamMode};
use genloop_node::testing::{ByteTokenizer, MemoryConnector, ScriptedEngine, SharedLink};
use genloop_node::Node;
use genloop_proto::Frame;

fn test_config(stream_mode: StreamMode) -> NodeConfig {
    NodeConfig {
        dispatcher_addr: "mem".to_string(),
        node_name: "test-node".to_string(),
        model_name: "test-model".to_string(),
        auth_token: "token".to_string(),
        max_concurrency: 4,
        tokenizer_path: "unused".into(),
        eos_token: "</s>".to_string(),
        context_limit: 2048,
        reserved_margin: 50,
        pad_id: 0,
        prompt_format: PromptFormat::Plain,
        stream_mode,
        flush_threshold: 15,
        keepalive_secs: 10,
        reconnect_backoff_secs: 10,
        busy_recv_timeout_ms: 1,
        idle_recv_timeout_ms: 100,
        watchdog_interval_secs: 30,
    }
}

fn test_node(
    stream_mode: StreamMode,
    engine: ScriptedEngine,
) -> (Node<ScriptedEngine, MemoryConnector>, SharedLink) {
    let shared = SharedLink::default();
    let connector = MemoryConnector::new(shared.clone());
    let mut node = Node::new(
        test_config(stream_mode),
        Box::new(ByteTokenizer),
        engine,
        connector,
    );
    node.seed_rng(0x5eed);
    (node, shared)
}

fn request_json(id: u32, max_new_tokens: u32) -> Vec<u8> {
    format!(
        r#"{{"id":{id},"system":"s","messages":[{{"role":"user","content":"hi"}}],"max_new_tokens":{max_new_tokens},"temperature":0}}"#
    )
    .into_bytes()
}

/// Frames the dispatcher observed, keepalives filtered out.
fn task_frames(shared: &SharedLink) -> Vec<Frame> {
    shared
        .sent()
        .iter()
        .map(|payload| Frame::decode(payload).expect("well-formed frame"))
        .filter(|frame| !matches!(frame, Frame::Keepalive))
        .collect()
}

/// Concatenated text frames for one task, in emission order.
fn text_for(frames: &[Frame], id: u32) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Text { id: fid, text } if *fid == id => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_eos_stops_before_budget_is_spent() {
    let mut engine = ScriptedEngine::new(256);
    // 'A', 'B', then end-of-sequence; the 3-token budget is never reached.
    engine.script(7, &[b'A' as u32, b'B' as u32, 0]);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    shared.push_inbound(request_json(7, 3));
    for _ in 0..5 {
        node.tick().await;
    }

    let frames = task_frames(&shared);
    assert_eq!(
        frames,
        vec![
            Frame::Text {
                id: 7,
                text: "A".to_string()
            },
            Frame::Text {
                id: 7,
                text: "B".to_string()
            },
            Frame::End { id: 7 },
        ]
    );
    assert_eq!(node.active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_completion_rebuilds_batch_for_survivor() {
    let mut engine = ScriptedEngine::new(256);
    engine.script(1, b"HIJKL".iter().map(|&b| b as u32).collect::<Vec<_>>().as_slice());
    engine.script(2, &[b'M' as u32, b'N' as u32]);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    shared.push_inbound(request_json(1, 5));
    shared.push_inbound(request_json(2, 2));

    // Admit both; run until the short task completes.
    for _ in 0..3 {
        node.tick().await;
    }
    let frames = task_frames(&shared);
    assert!(frames.contains(&Frame::End { id: 2 }));
    assert!(!frames.contains(&Frame::End { id: 1 }));
    assert_eq!(node.active_tasks(), 1);

    // The next step recomposes a one-row batch and keeps decoding task 1.
    node.tick().await;
    assert_eq!(node.batch_rows(), 1);

    for _ in 0..3 {
        node.tick().await;
    }
    let frames = task_frames(&shared);
    assert_eq!(text_for(&frames, 1), "HIJKL");
    assert_eq!(text_for(&frames, 2), "MN");

    // End markers are the last frame for each id.
    assert_eq!(
        frames.iter().filter(|f| f.task_id() == Some(1)).last(),
        Some(&Frame::End { id: 1 })
    );
    assert_eq!(node.active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_id_is_a_noop() {
    let engine = ScriptedEngine::new(256);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    shared.push_inbound(br#"{"id":99,"stop":true}"#.to_vec());
    for _ in 0..3 {
        node.tick().await;
    }

    assert!(task_frames(&shared).is_empty());
    assert_eq!(node.active_tasks(), 0);
    assert!(node.engine().aborted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_active_task_aborts_engine_state() {
    let mut engine = ScriptedEngine::new(256);
    engine.script(5, &[b'x' as u32; 32]);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    shared.push_inbound(request_json(5, 32));
    node.tick().await;
    assert_eq!(node.active_tasks(), 1);

    shared.push_inbound(br#"{"id":5,"stop":true}"#.to_vec());
    node.tick().await;
    assert_eq!(node.active_tasks(), 0);
    assert_eq!(node.engine().aborted, vec![5]);

    // Cancelled tasks end silently: no end-of-stream marker is produced.
    let frames = task_frames(&shared);
    assert!(!frames.contains(&Frame::End { id: 5 }));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_admit_registers_one_task() {
    let mut engine = ScriptedEngine::new(256);
    engine.script(3, &[b'x' as u32; 64]);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    shared.push_inbound(request_json(3, 64));
    shared.push_inbound(request_json(3, 64));
    for _ in 0..2 {
        node.tick().await;
    }

    assert_eq!(node.active_tasks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_produces_no_frames() {
    let engine = ScriptedEngine::new(256);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    // Budget larger than the whole context window fails admission.
    shared.push_inbound(request_json(11, 100_000));
    for _ in 0..3 {
        node.tick().await;
    }

    assert_eq!(node.active_tasks(), 0);
    assert!(task_frames(&shared).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_cadence_sends_one_keepalive_per_window() {
    let engine = ScriptedEngine::new(256);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);

    // 250 idle ticks at the 100 ms idle wait cover 25 virtual seconds.
    for _ in 0..250 {
        node.tick().await;
    }

    let keepalives = shared
        .sent()
        .iter()
        .filter(|payload| payload.is_empty())
        .count();
    assert_eq!(keepalives, 3);
    // No tasks means no composition work at all.
    assert_eq!(node.batch_rows(), 0);
    assert_eq!(node.engine().steps, 0);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_mode_batches_small_fragments() {
    let mut engine = ScriptedEngine::new(256);
    let script: Vec<u32> = b"streaming works fine".iter().map(|&b| b as u32).collect();
    engine.script(8, &script);
    let (mut node, shared) = test_node(StreamMode::Chunk, engine);

    shared.push_inbound(request_json(8, script.len() as u32));
    for _ in 0..script.len() + 3 {
        node.tick().await;
    }

    let frames = task_frames(&shared);
    // Fragments coalesce under the flush threshold, the text survives
    // intact, and the end marker closes the stream.
    assert!(frames.len() < script.len());
    assert_eq!(text_for(&frames, 8), "streaming works fine");
    assert_eq!(frames.last(), Some(&Frame::End { id: 8 }));
}

#[tokio::test(start_paused = true)]
async fn test_frames_survive_transport_failures() {
    let mut engine = ScriptedEngine::new(256);
    engine.script(4, &[b'Q' as u32, 0]);
    let (mut node, shared) = test_node(StreamMode::Diff, engine);
    shared.fail_sends(2);

    shared.push_inbound(request_json(4, 4));
    for _ in 0..4 {
        node.tick().await;
    }

    // Every frame was eventually delivered despite the dropped link.
    let frames = task_frames(&shared);
    assert_eq!(text_for(&frames, 4), "Q");
    assert_eq!(frames.last(), Some(&Frame::End { id: 4 }));
    assert!(shared.connect_count() > 1);
}
