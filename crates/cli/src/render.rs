use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use renderer::{
    DownloadEvent, DownloadThread, Frame, FrameHash, HostContext, HostTextures, PixelFormat,
    RendererConfig, TextureId, VideoRenderingParams,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use timeline::{BlockId, Evaluation, Fps, NeighborSample, Rational, Track, TransitionBlock};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";
/// Frames whose textures may be alive at once while the writer catches up.
const MAX_IN_FLIGHT: usize = 4;

pub struct RenderArgs {
    pub track: PathBuf,
    pub config: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub start: i64,
    pub end: Option<i64>,
    pub fps: Fps,
}

pub fn render_command(args: RenderArgs) -> Result<()> {
    let track = crate::load_track(&args.track)?;

    let mut config = match &args.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };
    config.apply_env()?;
    if let Some(out) = args.out {
        config.cache_dir = out;
    }
    config.validate()?;
    std::fs::create_dir_all(&config.cache_dir)
        .with_context(|| format!("creating cache dir {}", config.cache_dir.display()))?;

    let params = config.params();
    let end = args.end.unwrap_or_else(|| end_frame(&track, args.fps));
    info!(
        track = track.name(),
        start = args.start,
        end,
        format = %params.format,
        cache = %config.cache_dir.display(),
        "rendering"
    );

    let textures = HostTextures::new();
    let (events_tx, events_rx) = unbounded();
    let thread = DownloadThread::start(HostContext::new(textures.clone()), params, events_tx)?;

    let mut in_flight = InFlight::new(MAX_IN_FLIGHT, load_index(&config.cache_dir)?);
    let mut seen = HashSet::new();
    for frame in args.start..end {
        let time = Rational::from_frames(frame, args.fps);
        let Some(evaluation) = track.evaluate_at(time) else {
            debug!(frame, "past the end of the track");
            continue;
        };
        let description = describe(&track, &evaluation);
        let hash = FrameHash::compute(&params, description.as_bytes());
        if !seen.insert(hash) {
            continue;
        }
        in_flight.wait_for_room(&events_rx, &textures)?;
        let pixels = synthesize(&track, &evaluation);
        let texture = textures.upload(solid_frame(&params, &pixels)?);
        let filename = config.cache_path(&hash);
        thread.queue(texture, &filename, hash)?;
        in_flight.insert(hash, texture.id, filename);
        in_flight.drain_ready(&events_rx, &textures);
    }
    in_flight.finish(&events_rx, &textures)?;
    thread.cancel();

    let index_path = config.cache_dir.join(INDEX_FILE);
    std::fs::write(&index_path, serde_json::to_string_pretty(&in_flight.index)?)
        .with_context(|| format!("writing {}", index_path.display()))?;
    info!(
        frames = in_flight.written,
        failures = in_flight.failures,
        index = %index_path.display(),
        "render finished"
    );
    if in_flight.failures > 0 {
        bail!("{} frame(s) failed to export", in_flight.failures);
    }
    Ok(())
}

/// Frames handed to the download thread whose textures are still uploaded.
///
/// Each texture is released as soon as its event comes back, and the producer
/// waits once `limit` frames are outstanding.
struct InFlight {
    limit: usize,
    pending: HashMap<FrameHash, (TextureId, PathBuf)>,
    index: BTreeMap<FrameHash, PathBuf>,
    written: usize,
    failures: usize,
}

impl InFlight {
    fn new(limit: usize, index: BTreeMap<FrameHash, PathBuf>) -> Self {
        Self {
            limit: limit.max(1),
            pending: HashMap::new(),
            index,
            written: 0,
            failures: 0,
        }
    }

    fn insert(&mut self, hash: FrameHash, texture: TextureId, filename: PathBuf) {
        self.pending.insert(hash, (texture, filename));
    }

    fn wait_for_room(
        &mut self,
        events: &Receiver<DownloadEvent>,
        textures: &HostTextures,
    ) -> Result<()> {
        while self.pending.len() >= self.limit {
            self.wait_one(events, textures)?;
        }
        Ok(())
    }

    fn drain_ready(&mut self, events: &Receiver<DownloadEvent>, textures: &HostTextures) {
        for event in events.try_iter() {
            self.settle(event, textures);
        }
    }

    fn finish(&mut self, events: &Receiver<DownloadEvent>, textures: &HostTextures) -> Result<()> {
        while !self.pending.is_empty() {
            self.wait_one(events, textures)?;
        }
        Ok(())
    }

    fn wait_one(&mut self, events: &Receiver<DownloadEvent>, textures: &HostTextures) -> Result<()> {
        let event = events
            .recv()
            .context("download thread exited before reporting every frame")?;
        self.settle(event, textures);
        Ok(())
    }

    fn settle(&mut self, event: DownloadEvent, textures: &HostTextures) {
        match event {
            DownloadEvent::Downloaded(hash) => {
                if let Some((texture, filename)) = self.pending.remove(&hash) {
                    textures.release(texture);
                    self.index.insert(hash, filename);
                    self.written += 1;
                }
            }
            DownloadEvent::Failed {
                hash,
                filename,
                error,
            } => {
                self.failures += 1;
                warn!(%hash, file = %filename.display(), %error, "frame not cached");
                if let Some((texture, _)) = self.pending.remove(&hash) {
                    textures.release(texture);
                }
            }
        }
    }
}

/// First frame whose start lies at or past the end of the track.
fn end_frame(track: &Track, fps: Fps) -> i64 {
    let duration = track.duration();
    let mut end = duration.to_frames(fps);
    if Rational::from_frames(end, fps) < duration {
        end += 1;
    }
    end
}

fn load_index(dir: &Path) -> Result<BTreeMap<FrameHash, PathBuf>> {
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(&path)?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn source_of(track: &Track, block: BlockId) -> Option<&str> {
    track
        .get(block)
        .and_then(|b| b.as_clip())
        .map(|clip| clip.source.as_str())
}

/// Stable text identifying what a frame shows; equal text means equal pixels.
fn describe(track: &Track, evaluation: &Evaluation) -> String {
    let sample = |s: &Option<NeighborSample>| match s {
        Some(s) => format!("{}@{}", source_of(track, s.block).unwrap_or("?"), s.source_time),
        None => "none".to_string(),
    };
    match evaluation {
        Evaluation::Clip { block, source_time } => {
            format!("clip:{}@{source_time}", source_of(track, *block).unwrap_or("?"))
        }
        Evaluation::Gap { .. } => "gap".to_string(),
        Evaluation::Transition {
            progress,
            outgoing,
            incoming,
            ..
        } => format!("mix:{}|{}:{progress}", sample(outgoing), sample(incoming)),
    }
}

/// Premultiplied RGBA color for a clip source.
fn source_color(source: &str) -> [f32; 4] {
    let h = source
        .bytes()
        .fold(0x811c_9dc5u32, |acc, b| (acc ^ b as u32).wrapping_mul(0x0100_0193));
    let channel = |shift: u32| ((h >> shift) & 0xff) as f32 / 255.0;
    [channel(0), channel(8), channel(16), 1.0]
}

/// One RGBA pixel standing in for the whole frame.
fn synthesize(track: &Track, evaluation: &Evaluation) -> [f32; 4] {
    let color = |block: BlockId| source_of(track, block).map(source_color);
    match evaluation {
        Evaluation::Clip { block, .. } => color(*block).unwrap_or([0.0; 4]),
        Evaluation::Gap { .. } => [0.0; 4],
        Evaluation::Transition {
            progress,
            outgoing,
            incoming,
            ..
        } => {
            let out = outgoing.as_ref().and_then(|s| color(s.block));
            let inc = incoming.as_ref().and_then(|s| color(s.block));
            let mixed = TransitionBlock::blend_rgba(
                out.as_ref().map(|c| c.as_slice()),
                inc.as_ref().map(|c| c.as_slice()),
                progress.to_f64(),
            );
            let mut pixel = [0.0; 4];
            for (dst, src) in pixel.iter_mut().zip(mixed) {
                *dst = src;
            }
            pixel
        }
    }
}

fn solid_frame(params: &VideoRenderingParams, pixel: &[f32; 4]) -> Result<Frame> {
    let bytes: Vec<u8> = pixel.iter().flat_map(|v| v.to_ne_bytes()).collect();
    let data = bytes.repeat(params.width as usize * params.height as usize);
    Ok(Frame::from_data(params.width, params.height, PixelFormat::Rgba32F, data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline::Block;

    fn dissolve_track() -> (Track, BlockId, BlockId) {
        let mut track = Track::new("t");
        let a = track
            .append_block(Block::clip("a.mov", Rational::ZERO, Rational::from_integer(2)).unwrap())
            .unwrap();
        let b = track
            .append_block(Block::clip("b.mov", Rational::ZERO, Rational::from_integer(2)).unwrap())
            .unwrap();
        track
            .add_transition(Some(a), Some(b), Rational::ONE, Rational::ONE)
            .unwrap();
        (track, a, b)
    }

    #[test]
    fn end_frame_covers_partial_last_frame() {
        let mut track = Track::new("t");
        track.append_block(Block::gap(Rational::new(1, 10)).unwrap()).unwrap();
        assert_eq!(end_frame(&track, Fps::new(24, 1)), 3);
        assert_eq!(end_frame(&track, Fps::new(10, 1)), 1);
    }

    #[test]
    fn dissolve_fades_outgoing_then_incoming() {
        // Transition spans 1..3 with the cut at 2.
        let (track, _, _) = dissolve_track();
        let a = source_color("a.mov");
        let b = source_color("b.mov");

        let early = track.evaluate_at(Rational::new(3, 2)).unwrap();
        let pixel = synthesize(&track, &early);
        for c in 0..4 {
            assert!((pixel[c] - a[c] * 0.75).abs() < 1e-6);
        }
        assert_eq!(describe(&track, &early), "mix:a.mov@3/2|none:1/4");

        let late = track.evaluate_at(Rational::new(5, 2)).unwrap();
        let pixel = synthesize(&track, &late);
        for c in 0..4 {
            assert!((pixel[c] - b[c] * 0.75).abs() < 1e-6);
        }
        assert_eq!(describe(&track, &late), "mix:none|b.mov@1/2:3/4");
    }

    #[test]
    fn dangling_transition_fades_to_transparent() {
        let (mut track, _, b) = dissolve_track();
        track.remove_block(b).unwrap();
        // Only the outgoing second 1..2 remains.
        assert_eq!(track.duration(), Rational::from_integer(2));
        let evaluation = track.evaluate_at(Rational::new(3, 2)).unwrap();
        let pixel = synthesize(&track, &evaluation);
        assert!((pixel[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn textures_are_released_while_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let params = VideoRenderingParams::new(4, 2, PixelFormat::Rgba8);
        let textures = HostTextures::new();
        let (tx, rx) = unbounded();
        let thread =
            DownloadThread::start(HostContext::new(textures.clone()), params, tx).unwrap();

        let mut in_flight = InFlight::new(2, BTreeMap::new());
        for n in 0..12u8 {
            let hash = FrameHash::compute(&params, &[n]);
            in_flight.wait_for_room(&rx, &textures).unwrap();
            let texture = textures.upload(solid_frame(&params, &[0.5, 0.0, 0.0, 1.0]).unwrap());
            let filename = dir.path().join(format!("{hash}.png"));
            thread.queue(texture, &filename, hash).unwrap();
            in_flight.insert(hash, texture.id, filename);
            in_flight.drain_ready(&rx, &textures);
            assert!(textures.len() <= 2, "{} textures alive", textures.len());
        }
        in_flight.finish(&rx, &textures).unwrap();
        thread.cancel();

        assert!(textures.is_empty());
        assert_eq!(in_flight.written, 12);
        assert_eq!(in_flight.failures, 0);
        assert_eq!(in_flight.index.len(), 12);
    }

    #[test]
    fn failed_frames_release_their_texture() {
        let params = VideoRenderingParams::new(4, 2, PixelFormat::Rgba8);
        let textures = HostTextures::new();
        let (tx, rx) = unbounded();
        let thread =
            DownloadThread::start(HostContext::new(textures.clone()), params, tx).unwrap();

        let mut in_flight = InFlight::new(4, BTreeMap::new());
        let hash = FrameHash::compute(&params, b"bad");
        let texture = textures.upload(solid_frame(&params, &[0.0; 4]).unwrap());
        let filename = PathBuf::from("frame.unknown-extension");
        thread.queue(texture, &filename, hash).unwrap();
        in_flight.insert(hash, texture.id, filename);
        in_flight.finish(&rx, &textures).unwrap();

        assert!(textures.is_empty());
        assert_eq!(in_flight.failures, 1);
        assert!(in_flight.index.is_empty());
    }

    #[test]
    fn solid_frame_has_render_size() {
        let params = VideoRenderingParams::new(4, 2, PixelFormat::Rgba8);
        let frame = solid_frame(&params, &[1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.data.len(), 4 * 2 * 16);
    }
}
