//! A producer/viewer workload exercised against [`RelayCore`] (spec §2,
//! "Data flow"). This is the daemon binary's proof that the library's
//! surface is wired the way a real relay daemon's control/data/viewer
//! threads would use it — it does not implement the wire protocols that
//! would normally drive these calls (spec §1, "Out of scope").
//!
//! Each pass: announce a session, open a CTF trace and a stream inside it,
//! fill a handful of `relay_index` rows from both the control and data
//! "sides" in alternating order (spec §8, S1/S2), flush them to a real
//! index file under the configured trace root, then attach a viewer
//! session to the producer and tear it back down (spec §4.6).

use std::sync::Arc;

use log::{debug, warn};
use relayd_core::ctf_trace::ctf_trace_get_by_path_or_create;
use relayd_core::index::{
    relay_index_get_by_id_or_create, relay_index_try_flush, set_control_data, set_file,
    FlushOutcome,
};
use relayd_core::index_file::{FileIndexWriter, IndexFile};
use relayd_core::stream::{attach_index_file, try_stream_close, RelayStream};
use relayd_core::viewer::AttachOutcome;
use relayd_core::RelayCore;

use crate::health::{Liveness, Thread};

const PACKETS_PER_PASS: u64 = 4;
const PACKET_SIZE: u64 = 4096;
/// Minor version the demo workload pretends its producer speaks (spec §4.5,
/// "Encoding"): 2.8 or newer, so `stream_instance_id`/`packet_seq_num` are
/// written as-is rather than forced to the pre-2.8 sentinel.
const PRODUCER_MINOR_VERSION: u32 = 9;

pub async fn run(core: Arc<RelayCore>, trace_root: String, liveness: Arc<Liveness>) {
    if let Err(err) = tokio::fs::create_dir_all(&trace_root).await {
        warn!("demo workload: failed to create trace root {trace_root}: {err}");
        liveness.mark_failed(Thread::DemoWorkload);
        return;
    }

    let mut pass: u64 = 0;
    loop {
        match run_one_pass(&core, &trace_root, pass).await {
            Ok(flushed) => {
                debug!("demo workload pass {pass}: flushed {flushed} index records");
                liveness.mark_ok(Thread::DemoWorkload);
            }
            Err(err) => {
                warn!("demo workload pass {pass} failed: {err}");
                liveness.mark_failed(Thread::DemoWorkload);
            }
        }
        pass += 1;
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
    }
}

async fn run_one_pass(core: &RelayCore, trace_root: &str, pass: u64) -> anyhow::Result<usize> {
    let session = core.create_session(
        "localhost",
        format!("demo-session-{pass}"),
        format!("{trace_root}/session-{pass}"),
    );
    let trace = ctf_trace_get_by_path_or_create(&session, "ust/uid/0/64-bit");
    let stream = RelayStream::new(&trace);
    core.register_stream(stream.clone());
    relayd_core::ctf_trace::ctf_trace_put(&trace);

    let index_path = format!("{trace_root}/session-{pass}-stream-{}.idx", stream.handle);
    let writer = FileIndexWriter::create(&index_path)?;
    attach_index_file(&stream, IndexFile::new(writer));

    let mut flushed = 0;
    for seq in 0..PACKETS_PER_PASS {
        let index = relay_index_get_by_id_or_create(&stream, seq);
        if seq % 2 == 0 {
            set_control_data(
                &index,
                PACKET_SIZE,
                PACKET_SIZE - 8,
                seq * 10,
                seq * 10 + 5,
                0,
                stream.handle,
                seq,
                seq,
                PRODUCER_MINOR_VERSION,
            )?;
            set_file(&index, seq * PACKET_SIZE)?;
        } else {
            set_file(&index, seq * PACKET_SIZE)?;
            set_control_data(
                &index,
                PACKET_SIZE,
                PACKET_SIZE - 8,
                seq * 10,
                seq * 10 + 5,
                0,
                stream.handle,
                seq,
                seq,
                PRODUCER_MINOR_VERSION,
            )?;
        }
        if relay_index_try_flush(&index) == FlushOutcome::Flushed {
            flushed += 1;
        }
    }

    exercise_viewer(core, &session);

    try_stream_close(&stream);
    core.reap_stream(&stream);
    core.reap_session(&session);
    session_put_self(&session);

    Ok(flushed)
}

/// Attach a fresh viewer session to `producer`, confirm the attachment,
/// then close it back down — the spec §8 S6 scenario, run against the
/// core's real registries instead of a unit test's bare handles.
fn exercise_viewer(core: &RelayCore, producer: &relayd_core::session::SessionHandle) {
    let viewer = core.create_viewer_session();
    match core.attach_viewer(&viewer, producer) {
        AttachOutcome::Ok => {
            debug_assert!(relayd_core::viewer::is_attached(&viewer, producer));
            core.close_viewer_session(&viewer);
        }
        other => warn!("demo workload: unexpected viewer attach outcome {other:?}"),
    }
}

/// The demo's own handle on `session` (the one returned by
/// `create_session`) is released once this pass is done with it; the
/// session's lifetime past that point is carried entirely by the trace/
/// stream counted references that were already released above via
/// `try_stream_close`.
fn session_put_self(session: &relayd_core::session::SessionHandle) {
    relayd_core::session::session_put(session);
}
