//! Top-level video pipeline state machine (§5).
//!
//! Grounded in `VideoPipeline::Initialize`/`Shutdown`: capture feeds the
//! decode stage, decode feeds encode, encode runs the Annex-B parser and
//! hands each assembled picture (parameter sets prepended for keyframes)
//! to the caller's sink. Unlike the original's fire-and-forget threads,
//! a supervisor thread here watches for `CaptureLost`/`FatalEncode` errors
//! and restarts the whole chain with exponential-linear backoff.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{AppError, PipelineError, Result};
use crate::video::capture::CaptureSource;
use crate::video::chroma::yuyv_to_yuv420;
use crate::video::decoder::JpegDecoder;
use crate::video::encoder::{EncoderConfig, H264Encoder};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::{Frame, FramePool};
use crate::video::parser::VideoParser;
use crate::video::stage::PipelineStage;
use crate::video::stats::Statistics;

const BACKOFF_STEPS_SECS: [u64; 4] = [1, 2, 3, 4];
const STALE_OUTPUT_THRESHOLD: Duration = Duration::from_secs(2);

/// Lifecycle state of a [`VideoPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Shutdown,
}

impl From<u8> for PipelineState {
    fn from(v: u8) -> Self {
        match v {
            0 => PipelineState::Stopped,
            1 => PipelineState::Starting,
            2 => PipelineState::Running,
            3 => PipelineState::Backoff,
            _ => PipelineState::Shutdown,
        }
    }
}

impl From<PipelineState> for u8 {
    fn from(s: PipelineState) -> u8 {
        match s {
            PipelineState::Stopped => 0,
            PipelineState::Starting => 1,
            PipelineState::Running => 2,
            PipelineState::Backoff => 3,
            PipelineState::Shutdown => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoPipelineConfig {
    pub encoder: EncoderConfig,
    pub decode_queue_len: usize,
    pub encode_queue_len: usize,
    pub app_queue_len: usize,
    pub frame_pool_size: usize,
}

impl Default for VideoPipelineConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            decode_queue_len: 2,
            encode_queue_len: 2,
            app_queue_len: 4,
            frame_pool_size: 4,
        }
    }
}

/// One fully assembled H.264 access unit ready for RTP payloadization.
pub struct PictureOutput {
    pub sequence: u64,
    pub shutter_usec: u64,
    pub data: Bytes,
    pub keyframe: bool,
}

type OutputSink = Arc<dyn Fn(PictureOutput) + Send + Sync>;
type EncoderFactory = Arc<dyn Fn() -> Result<Box<dyn H264Encoder>> + Send + Sync>;
type CaptureFactory = Arc<dyn Fn() -> Result<Box<dyn CaptureSource>> + Send + Sync>;

/// Owns the capture/decode/encode pipeline stages and supervises restarts.
pub struct VideoPipeline {
    state: Arc<AtomicU8>,
    stats: Arc<Statistics>,
    terminated: Arc<std::sync::atomic::AtomicBool>,
    supervisor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VideoPipeline {
    pub fn state(&self) -> PipelineState {
        PipelineState::from(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Start the supervisor thread, which opens `capture_factory()` and
    /// runs the pipeline until told to shut down, restarting with backoff
    /// whenever the capture source or encoder reports a fatal error.
    pub fn start(
        config: VideoPipelineConfig,
        capture_factory: CaptureFactory,
        encoder_factory: EncoderFactory,
        sink: OutputSink,
    ) -> Arc<Self> {
        let state = Arc::new(AtomicU8::new(PipelineState::Starting.into()));
        let stats = Statistics::new();
        let terminated = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let supervisor_state = state.clone();
        let supervisor_stats = stats.clone();
        let supervisor_terminated = terminated.clone();

        let handle = std::thread::Builder::new()
            .name("pipeline-supervisor".into())
            .spawn(move || {
                run_supervisor(
                    config,
                    capture_factory,
                    encoder_factory,
                    sink,
                    supervisor_state,
                    supervisor_stats,
                    supervisor_terminated,
                );
            })
            .expect("failed to spawn pipeline supervisor thread");

        Arc::new(Self { state, stats, terminated, supervisor: Mutex::new(Some(handle)) })
    }

    pub fn shutdown(&self) {
        self.terminated.store(true, Ordering::Release);
        self.state.store(PipelineState::Shutdown.into(), Ordering::Release);
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_supervisor(
    config: VideoPipelineConfig,
    capture_factory: CaptureFactory,
    encoder_factory: EncoderFactory,
    sink: OutputSink,
    state: Arc<AtomicU8>,
    stats: Arc<Statistics>,
    terminated: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut backoff_index = 0usize;

    while !terminated.load(Ordering::Acquire) {
        state.store(PipelineState::Starting.into(), Ordering::Release);

        let capture = match capture_factory() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "capture open failed, backing off");
                state.store(PipelineState::Backoff.into(), Ordering::Release);
                backoff_and_wait(&mut backoff_index, &terminated);
                continue;
            }
        };

        let encoder = match encoder_factory() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "encoder init failed, backing off");
                state.store(PipelineState::Backoff.into(), Ordering::Release);
                backoff_and_wait(&mut backoff_index, &terminated);
                continue;
            }
        };

        backoff_index = 0;
        state.store(PipelineState::Running.into(), Ordering::Release);

        match run_pipeline_chain(&config, capture, encoder, sink.clone(), stats.clone(), terminated.clone()) {
            Ok(()) => break, // terminated flag was set; exit cleanly.
            Err(e) => {
                tracing::warn!(error = %e, "pipeline chain failed, restarting after backoff");
                state.store(PipelineState::Backoff.into(), Ordering::Release);
                backoff_and_wait(&mut backoff_index, &terminated);
            }
        }
    }

    state.store(PipelineState::Shutdown.into(), Ordering::Release);
}

fn backoff_and_wait(index: &mut usize, terminated: &std::sync::atomic::AtomicBool) {
    let secs = BACKOFF_STEPS_SECS[(*index).min(BACKOFF_STEPS_SECS.len() - 1)];
    *index += 1;
    let deadline = std::time::Instant::now() + Duration::from_secs(secs);
    while std::time::Instant::now() < deadline {
        if terminated.load(Ordering::Acquire) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Runs one decode/encode/parse chain against an already-open capture
/// source and encoder until `terminated` is set or either reports a fatal
/// error, in which case it returns `Err` so the supervisor can back off and
/// retry with fresh instances.
fn run_pipeline_chain(
    config: &VideoPipelineConfig,
    mut capture: Box<dyn CaptureSource>,
    encoder: Box<dyn H264Encoder>,
    sink: OutputSink,
    stats: Arc<Statistics>,
    terminated: Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    let pool = FramePool::new(config.frame_pool_size);
    let decoder = Arc::new(Mutex::new(JpegDecoder::new()?));
    let encoder = Arc::new(Mutex::new(encoder));
    let parser = Arc::new(Mutex::new(VideoParser::new()));

    let decode_stage = PipelineStage::spawn("decode", config.decode_queue_len);
    let encode_stage = Arc::new(PipelineStage::spawn("encode", config.encode_queue_len));
    let app_stage = Arc::new(PipelineStage::spawn("app", config.app_queue_len));

    let fatal: Arc<Mutex<Option<AppError>>> = Arc::new(Mutex::new(None));
    // The device's actually-negotiated format (capture.rs may fall back from
    // the requested format, e.g. MJPG -> YUYV) drives how each raw frame is
    // turned into a YUV420P frame for the encoder (§4.8 step 2).
    let input_format = capture.format();
    let input_resolution = capture.resolution();

    let result = loop {
        if terminated.load(Ordering::Acquire) {
            break Ok(());
        }
        if let Some(err) = fatal.lock().take() {
            break Err(err);
        }

        let frame = match capture.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(e) => break Err(e),
        };

        stats.record_input_frame(frame.data.len());
        stats.check_stale_output(STALE_OUTPUT_THRESHOLD);

        let decoder = decoder.clone();
        let encoder = encoder.clone();
        let parser = parser.clone();
        let pool = pool.clone();
        let sink = sink.clone();
        let stats = stats.clone();
        let fatal_inner = fatal.clone();
        let encode_stage_inner = encode_stage.clone();
        let app_stage_inner = app_stage.clone();

        let jpeg = frame.data;
        let sequence = frame.sequence;
        let shutter_usec = frame.shutter_usec;

        decode_stage.queue(move || {
            let decoded = match input_format {
                PixelFormat::Jpeg => decoder.lock().decode(&jpeg, &pool),
                PixelFormat::Yuyv => {
                    decode_yuyv(&jpeg, &pool, input_resolution).map_err(Into::into)
                }
                other => Err(PipelineError::UnsupportedFormat(other).into()),
            };
            let decoded = match decoded {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping frame: decode failed");
                    return;
                }
            };

            encode_stage_inner.queue(move || {
                let encoded = encoder.lock().encode(&decoded, sequence, shutter_usec);
                let encoded = match encoded {
                    Ok(Some(e)) => e,
                    Ok(None) => return,
                    Err(AppError::Pipeline(PipelineError::FatalEncode(msg))) => {
                        *fatal_inner.lock() = Some(PipelineError::FatalEncode(msg).into());
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping frame: encode failed");
                        return;
                    }
                };

                stats.record_output_frame(encoded.data.len());

                let mut parser = parser.lock();
                if let Err(e) = parser.parse(false, &encoded.data) {
                    // `parse` already skipped the offending NAL and kept
                    // parsing the rest of the access unit (§7); any pictures
                    // it did assemble are still valid and get emitted below.
                    tracing::warn!(error = %e, "encoder output had a bad NAL unit, skipped it");
                }

                if parser.pictures.is_empty() {
                    tracing::warn!("encoder output produced no picture");
                    return;
                }

                let parameters: Vec<u8> = parser
                    .parameter_ranges
                    .iter()
                    .flat_map(|&(s, e)| encoded.data[s..e].to_vec())
                    .collect();

                for picture in parser.pictures.drain(..) {
                    let mut buf = Vec::with_capacity(picture.total_bytes + parameters.len());
                    if picture.keyframe {
                        buf.extend_from_slice(&parameters);
                    }
                    for &(s, e) in &picture.slice_ranges {
                        buf.extend_from_slice(&encoded.data[s..e]);
                    }

                    let sink = sink.clone();
                    let keyframe = picture.keyframe;
                    app_stage_inner.queue(move || {
                        sink(PictureOutput { sequence, shutter_usec, data: Bytes::from(buf), keyframe });
                    });
                }
            });
        });
    };

    decode_stage.shutdown();
    if let Ok(stage) = Arc::try_unwrap(encode_stage) {
        stage.shutdown();
    }
    if let Ok(stage) = Arc::try_unwrap(app_stage) {
        stage.shutdown();
    }

    result
}

/// Unpack a raw YUYV-negotiated capture frame into a pool-allocated
/// YUV420P frame, bypassing the JPEG decoder entirely (§4.8 step 2).
fn decode_yuyv(
    yuyv: &Bytes,
    pool: &Arc<FramePool>,
    resolution: Resolution,
) -> std::result::Result<Frame, PipelineError> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let row_bytes = width * 2;
    let needed = row_bytes * height;
    if yuyv.len() < needed {
        return Err(PipelineError::TransientDecode(format!(
            "short YUYV frame: need {needed} bytes, have {}",
            yuyv.len()
        )));
    }

    let mut frame = pool.allocate(resolution.width, resolution.height, PixelFormat::Yuv420p);
    let out_width = frame.width() as usize;
    let out_chroma_width = out_width / 2;

    let mut y_scratch = vec![0u8; width * height];
    let mut u_scratch = vec![0u8; (width / 2) * (height / 2)];
    let mut v_scratch = vec![0u8; (width / 2) * (height / 2)];
    yuyv_to_yuv420(yuyv, &mut y_scratch, &mut u_scratch, &mut v_scratch, width, height, row_bytes);

    for row in 0..height {
        frame.plane_mut(0)[row * out_width..row * out_width + width]
            .copy_from_slice(&y_scratch[row * width..(row + 1) * width]);
    }
    let chroma_w = width / 2;
    for row in 0..height / 2 {
        frame.plane_mut(1)[row * out_chroma_width..row * out_chroma_width + chroma_w]
            .copy_from_slice(&u_scratch[row * chroma_w..(row + 1) * chroma_w]);
        frame.plane_mut(2)[row * out_chroma_width..row * out_chroma_width + chroma_w]
            .copy_from_slice(&v_scratch[row * chroma_w..(row + 1) * chroma_w]);
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::EncodedFrame as EncFrame;

    struct PassthroughEncoder;

    impl H264Encoder for PassthroughEncoder {
        fn encode(&mut self, _frame: &Frame, sequence: u64, shutter_usec: u64) -> Result<Option<EncFrame>> {
            let mut data = vec![0, 0, 1, 0x67, 1]; // fake SPS
            data.extend([0, 0, 1, 0x68, 2]); // fake PPS
            data.extend([0, 0, 1]);
            data.push(0x65);
            data.push(0b1000_0000); // first_mb_in_slice = 0
            Ok(Some(EncFrame { data: Bytes::from(data), key_frame: true, sequence, shutter_usec }))
        }
        fn request_keyframe(&mut self) {}
        fn set_bitrate_kbps(&mut self, _kbps: u32) -> Result<()> {
            Ok(())
        }
        fn config(&self) -> &EncoderConfig {
            unimplemented!("not exercised by pipeline tests")
        }
    }

    #[test]
    fn pipeline_state_round_trips_through_u8() {
        for s in [
            PipelineState::Stopped,
            PipelineState::Starting,
            PipelineState::Running,
            PipelineState::Backoff,
            PipelineState::Shutdown,
        ] {
            let raw: u8 = s.into();
            assert_eq!(PipelineState::from(raw), s);
        }
    }

    #[test]
    fn backoff_steps_are_capped() {
        assert_eq!(BACKOFF_STEPS_SECS, [1, 2, 3, 4]);
        assert_eq!(BACKOFF_STEPS_SECS[10usize.min(BACKOFF_STEPS_SECS.len() - 1)], 4);
    }

    #[test]
    fn parser_groups_passthrough_encoder_output_into_one_keyframe_picture() {
        // Exercises the same picture-assembly logic `run_pipeline_chain`
        // runs inside the encode stage, without spinning up real threads
        // or a real JPEG decoder.
        let mut encoder = PassthroughEncoder;
        let pool = FramePool::new(1);
        let frame = pool.allocate(16, 16, PixelFormat::Yuv420p);

        let encoded = encoder.encode(&frame, 7, 1234).unwrap().unwrap();

        let mut parser = VideoParser::new();
        parser.parse(false, &encoded.data).unwrap();

        assert_eq!(parser.pictures.len(), 1);
        assert!(parser.pictures[0].keyframe);

        let parameters: Vec<u8> =
            parser.parameter_ranges.iter().flat_map(|&(s, e)| encoded.data[s..e].to_vec()).collect();
        assert_eq!(parameters, vec![0x67, 1, 0x68, 2]);
    }

    #[test]
    fn decode_yuyv_produces_yuv420_frame_of_expected_size() {
        let width = 4u32;
        let height = 2u32;
        let row = [0u8, 128, 10, 140, 20, 150, 30, 160]; // 4 YUYV pixels
        let mut data = Vec::new();
        data.extend_from_slice(&row);
        data.extend_from_slice(&row);
        let yuyv = Bytes::from(data);

        let pool = FramePool::new(1);
        let frame = decode_yuyv(&yuyv, &pool, Resolution::new(width, height)).unwrap();

        assert_eq!(frame.format(), PixelFormat::Yuv420p);
        assert!(frame.plane(0).len() >= (width * height) as usize);
    }

    #[test]
    fn decode_yuyv_rejects_short_frame() {
        let pool = FramePool::new(1);
        let yuyv = Bytes::from(vec![0u8; 4]);
        assert!(decode_yuyv(&yuyv, &pool, Resolution::new(16, 16)).is_err());
    }
}
