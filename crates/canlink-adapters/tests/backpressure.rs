//! Inbound backpressure on the loopback adapter
//!
//! A consumer that stops reading must never stall the pumps: frames beyond the
//! inbound depth are dropped and each drop is reported.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canlink_adapters::driver::loopback::LoopbackAdapter;
use canlink_core::{Adapter, AdapterError, CancelToken, ChannelDepths, Config, Frame};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn depths(inbound: usize) -> ChannelDepths {
    ChannelDepths {
        outbound: 64,
        inbound,
        errors: 5,
    }
}

/// Send `count` frames to a loopback whose inbound channel holds `inbound`,
/// then collect every dropped id from both the error channel and the callback.
async fn flood(inbound: usize, count: u32) -> (Vec<u32>, Vec<u32>) {
    let spilled = Arc::new(Mutex::new(Vec::new()));
    let config = {
        let spilled = spilled.clone();
        Config::default().on_error(move |err| {
            if let AdapterError::DroppedFrame { id } = err {
                spilled.lock().push(*id);
            }
        })
    };
    let adapter = LoopbackAdapter::with_depths(config, depths(inbound));
    let mut rx = adapter.recv().unwrap();
    let mut errors = adapter.errors().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    let tx = adapter.sender();
    for n in 0..count {
        tx.send(Frame::outgoing(0x100 + n, vec![n as u8])).await.unwrap();
    }

    let expected_drops = count.saturating_sub(inbound as u32) as usize;
    let mut dropped = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            while let Ok(err) = errors.try_recv() {
                if let AdapterError::DroppedFrame { id } = err {
                    dropped.push(id);
                }
            }
            if dropped.len() + spilled.lock().len() >= expected_drops {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("drops were not all reported");
    dropped.extend(spilled.lock().iter().copied());
    dropped.sort_unstable();

    // Every drop is in, so reading now cannot make room for a dropped frame
    let kept = count.min(inbound as u32) as usize;
    let mut delivered = Vec::new();
    while delivered.len() < kept {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame not delivered")
            .expect("inbound channel closed");
        delivered.push(frame.id());
    }
    assert!(rx.try_recv().is_err());
    adapter.close().await.unwrap();
    (delivered, dropped)
}

#[tokio::test]
async fn test_full_inbound_drops_and_reports() {
    let (delivered, dropped) = flood(4, 10).await;
    assert_eq!(delivered, vec![0x100, 0x101, 0x102, 0x103]);
    assert_eq!(dropped, (0x104..0x10A).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_sender_never_blocks_on_slow_consumer() {
    let adapter = LoopbackAdapter::with_depths(Config::default(), depths(1));
    let _rx = adapter.recv().unwrap();
    adapter.connect(&CancelToken::new()).await.unwrap();

    let tx = adapter.sender();
    tokio::time::timeout(Duration::from_secs(2), async {
        for n in 0..500u32 {
            tx.send(Frame::outgoing(0x200, vec![n as u8])).await.unwrap();
        }
    })
    .await
    .expect("outbound stalled behind a full inbound channel");
    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_adapter_rejects_use() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = {
        let calls = calls.clone();
        Config::default().on_error(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    let adapter = LoopbackAdapter::new(config);
    adapter.close().await.unwrap();
    assert!(matches!(
        adapter.connect(&CancelToken::new()).await,
        Err(AdapterError::Closed)
    ));
    assert!(matches!(adapter.set_filter(&[0x7E8]).await, Err(AdapterError::Closed)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_frame_is_delivered_or_reported(inbound in 1usize..8, count in 0u32..24) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (delivered, dropped) = runtime.block_on(flood(inbound, count));

        let kept = count.min(inbound as u32);
        prop_assert_eq!(delivered, (0..kept).map(|n| 0x100 + n).collect::<Vec<u32>>());
        prop_assert_eq!(dropped, (kept..count).map(|n| 0x100 + n).collect::<Vec<u32>>());
    }
}
