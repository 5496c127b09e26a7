// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! drm_player, a small player pushing packets through the decode pipeline and showing the
//! decoded frames on a DRM output.
//!
//! Packets are fixed-size chunks of the input file, or synthetic payloads when no input is given.
//! Decoding is done by the in-process dummy backend.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use argh::FromArgs;
use avpipe::backend::dummy::DummyDecoder;
use avpipe::backend::dummy::DummyOptions;
use avpipe::backend::Codec;
use avpipe::backend::StreamParams;
use avpipe::display::dummy::DummyDisplay;
use avpipe::display::BlitFlags;
use avpipe::display::DisplayConfig;
use avpipe::display::DisplaySession;
use avpipe::packet::packet_pool;
use avpipe::packet::PooledPacket;
use avpipe::pipeline;
use avpipe::pipeline::FaultPolicy;
use avpipe::pipeline::PipelineConfig;
use avpipe::pipeline::SessionContext;
use avpipe::queue::TransferQueue;
use avpipe::video_frame::Frame;
use avpipe::video_frame::VideoItem;
use avpipe::Rational;
use avpipe::Resolution;
use bytes::Bytes;

/// Play a stream through the decode pipeline
#[derive(Debug, FromArgs)]
struct Args {
    /// input file, cut into packets of --packet-size bytes
    #[argh(positional)]
    input: Option<PathBuf>,

    /// DRM device to display on. Default: /dev/dri/card0
    #[argh(option, default = "PathBuf::from(\"/dev/dri/card0\")")]
    device: PathBuf,

    /// index of the display mode to use. Default: 0
    #[argh(option, default = "0")]
    mode: usize,

    /// codec of the input. Default: h264
    #[argh(option, default = "Codec::H264")]
    codec: Codec,

    /// size of the packets cut from the input. Default: 4096
    #[argh(option, default = "4096")]
    packet_size: usize,

    /// number of synthetic packets to play without input. Default: 300
    #[argh(option, default = "300")]
    frames: usize,

    /// frame rate of the stream. Default: 30
    #[argh(option, default = "30")]
    fps: i32,

    /// what to do when the decoder rejects a packet. Default: terminate
    #[argh(option, default = "FaultPolicy::Terminate")]
    fault_policy: FaultPolicy,

    /// compose in memory instead of opening a DRM device
    #[argh(switch)]
    headless: bool,
}

fn open_display(args: &Args) -> DisplaySession {
    if !args.headless {
        let config = DisplayConfig { device: args.device.clone(), mode_index: args.mode };
        match DisplaySession::open_drm(&config) {
            Ok(session) => return session,
            Err(e) => log::warn!("cannot use {}: {e}, composing in memory", args.device.display()),
        }
    }
    DisplaySession::new(Box::new(DummyDisplay::new(Resolution::from((640, 480)), 2)))
}

fn load_payloads(args: &Args) -> Vec<Bytes> {
    match &args.input {
        Some(path) => {
            let mut buf = Vec::new();
            File::open(path)
                .expect("error opening input file")
                .read_to_end(&mut buf)
                .expect("error reading input file");
            let buf = Bytes::from(buf);
            (0..buf.len())
                .step_by(args.packet_size.max(1))
                .map(|start| buf.slice(start..(start + args.packet_size).min(buf.len())))
                .collect()
        }
        None => (0..args.frames)
            .map(|i| Bytes::from((i as u32).to_le_bytes().repeat(64)))
            .collect(),
    }
}

/// Feed `payloads` to the pipeline, one frame period apart in the stream time base.
fn demux(payloads: Vec<Bytes>, packets: Arc<TransferQueue<PooledPacket>>) {
    let pool = packet_pool(16);
    for (pts, data) in payloads.into_iter().enumerate() {
        let mut packet = loop {
            match pool.acquire() {
                Ok(packet) => break packet,
                Err(_) => thread::sleep(Duration::from_millis(2)),
            }
        };
        packet.data = data;
        packet.pts = Some(pts as i64);
        packet.dts = Some(pts as i64);

        if let Err(e) = packets.put(packet) {
            log::info!("demuxer stopped: {}", e.error);
            return;
        }
    }
    packets.drain_then_close();
    log::info!("end of input");
}

/// Copy `frame` to the middle of the screen, cropping it if it does not fit.
fn show(display: &DisplaySession, frame: &Frame) {
    let Some(data) = frame.data() else {
        log::debug!("skipping opaque frame");
        return;
    };
    let screen = display.resolution();
    let w = frame.resolution.width.min(screen.width);
    let h = frame.resolution.height.min(screen.height);
    let x = (screen.width - w) / 2;
    let y = (screen.height - h) / 2;

    let root = display.root();
    if let Err(e) = display.blit_raw(root, data, frame.pitch(), w, h, BlitFlags::NONE, x, y) {
        log::error!("cannot draw frame: {e}");
        return;
    }
    if let Err(e) = display.present(root, false) {
        log::error!("cannot present frame: {e}");
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();
    let display = open_display(&args);

    let packets = Arc::new(TransferQueue::new(32));
    let frames = Arc::new(TransferQueue::new(4));
    let context = SessionContext {
        stream: StreamParams {
            codec: args.codec,
            extradata: Bytes::new(),
            frame_rate: Rational::new(args.fps, 1),
            time_base: Rational::new(1, args.fps),
        },
        packets: Arc::clone(&packets),
        frames: Arc::clone(&frames),
    };
    let backend = DummyDecoder::new(DummyOptions {
        resolution: Resolution::from((320, 240)),
        ..Default::default()
    });
    let config = PipelineConfig { fault_policy: args.fault_policy, ..Default::default() };
    let mut session = pipeline::start(context, backend, config).expect("error starting decoder");

    let demuxer = {
        let payloads = load_payloads(&args);
        let packets = Arc::clone(&packets);
        thread::spawn(move || demux(payloads, packets))
    };

    // Presentation clock: a timestamp and the moment it is due.
    let mut clock: Option<(Instant, i64)> = None;
    let mut shown = 0usize;
    // The frame on screen stays alive until the next one replaces it.
    let mut on_screen = None;
    while let Ok(item) = frames.get() {
        let frame = match item {
            VideoItem::SetClock(pts) => {
                log::debug!("clock reset to {pts:?}");
                clock = pts.map(|pts| (Instant::now(), pts));
                continue;
            }
            VideoItem::Frame(frame) => frame,
        };

        if let (Some((start, origin)), Some(pts)) = (clock, frame.pts) {
            let due = start + Duration::from_micros(pts.saturating_sub(origin).max(0) as u64);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }

        show(&display, &frame);
        on_screen = Some(frame);
        shown += 1;
    }

    // The session only ends once every frame went back to the decoder.
    drop(on_screen.take());
    let end = session.wait();
    let _ = demuxer.join();
    println!("{shown} frames shown, session ended with {end:?}");
}
