//! Background export of rendered textures into the on-disk frame cache.
//!
//! The render thread hands finished textures to a [`DownloadThread`], which
//! reads each one back through its own read framebuffer, writes it to disk and
//! reports the frame hash once the file is complete. Producers never wait on
//! the GPU or the disk.

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, info_span, warn};

use crate::pixel::get_pixel_format_info;
use crate::{
    write_image, FrameHash, FramebufferId, GraphicsContext, ImageSpec, PixelFormatInfo,
    RendererError, TextureHandle, VideoRenderingParams,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadQueueEntry {
    pub texture: TextureHandle,
    pub filename: PathBuf,
    pub hash: FrameHash,
}

#[derive(Debug)]
pub enum DownloadEvent {
    /// The frame's file is written and closed.
    Downloaded(FrameHash),
    Failed {
        hash: FrameHash,
        filename: PathBuf,
        error: RendererError,
    },
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<DownloadQueueEntry>,
    cancelled: bool,
}

/// FIFO of pending downloads shared by producers and the worker.
///
/// Once cancelled, pushes are refused but entries already queued are still
/// handed out until the queue is empty.
#[derive(Default)]
pub struct DownloadQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: DownloadQueueEntry) -> Result<(), RendererError> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(RendererError::Stopped);
        }
        state.entries.push_back(entry);
        drop(state);
        self.wake.notify_all();
        Ok(())
    }

    /// Blocks until an entry is available. `None` once cancelled and empty.
    pub fn pop_blocking(&self) -> Option<DownloadQueueEntry> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            if state.cancelled {
                return None;
            }
            self.wake.wait(&mut state);
        }
    }

    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.wake.notify_all();
    }

    /// Cancels and takes every entry still queued.
    fn close_and_take(&self) -> Vec<DownloadQueueEntry> {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.entries.drain(..).collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owner of the download worker.
///
/// `queue` may be called from any thread holding a reference. Dropping the
/// thread cancels it, finishes the queued entries and joins the worker.
pub struct DownloadThread {
    queue: Arc<DownloadQueue>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DownloadThread {
    /// Takes ownership of `context` and starts the worker.
    ///
    /// Fails up front when `params.format` has no transfer layout.
    pub fn start<C>(
        context: C,
        params: VideoRenderingParams,
        events: Sender<DownloadEvent>,
    ) -> Result<Self, RendererError>
    where
        C: GraphicsContext + 'static,
    {
        let format_info = get_pixel_format_info(params.format)?;
        let queue = Arc::new(DownloadQueue::new());
        let worker = DownloadWorker {
            context,
            params,
            format_info,
            queue: Arc::clone(&queue),
            events,
        };
        let handle = thread::Builder::new()
            .name("framecache-download".into())
            .spawn(move || worker.run())?;
        info!(
            target: "renderer::download",
            width = params.width,
            height = params.height,
            format = %params.format,
            "download thread started"
        );
        Ok(Self {
            queue,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn queue(
        &self,
        texture: TextureHandle,
        filename: impl Into<PathBuf>,
        hash: FrameHash,
    ) -> Result<(), RendererError> {
        self.queue.push(DownloadQueueEntry {
            texture,
            filename: filename.into(),
            hash,
        })
    }

    /// Entries queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.queue.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops accepting entries and blocks until the worker has written
    /// everything already queued and exited. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.queue.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "renderer::download", "download worker panicked");
            } else {
                debug!(target: "renderer::download", "download thread joined");
            }
        }
    }
}

impl Drop for DownloadThread {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct DownloadWorker<C> {
    context: C,
    params: VideoRenderingParams,
    format_info: PixelFormatInfo,
    queue: Arc<DownloadQueue>,
    events: Sender<DownloadEvent>,
}

impl<C: GraphicsContext> DownloadWorker<C> {
    fn run(mut self) {
        let span = info_span!(
            "download_thread",
            width = self.params.width,
            height = self.params.height,
            format = self.format_info.name
        );
        let _guard = span.enter();

        let buffer_size = self
            .format_info
            .buffer_size(self.params.width, self.params.height);
        let framebuffer = match self.context.create_read_framebuffer(buffer_size) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                error!(target: "renderer::download", error = %err, "failed to create read framebuffer");
                for entry in self.queue.close_and_take() {
                    self.emit(DownloadEvent::Failed {
                        hash: entry.hash,
                        filename: entry.filename,
                        error: RendererError::Readback(format!("no read framebuffer: {err}")),
                    });
                }
                return;
            }
        };
        let mut data_buffer = vec![0u8; buffer_size];

        while let Some(entry) = self.queue.pop_blocking() {
            self.process(framebuffer, entry, &mut data_buffer);
        }

        self.context.delete_framebuffer(framebuffer);
        debug!(target: "renderer::download", "download thread exiting");
    }

    fn process(&mut self, framebuffer: FramebufferId, entry: DownloadQueueEntry, buffer: &mut [u8]) {
        let result = self
            .download(framebuffer, &entry.texture, buffer)
            .and_then(|()| {
                let spec = ImageSpec::new(self.params.width, self.params.height, &self.format_info);
                write_image(&entry.filename, &spec, buffer)
            });

        match result {
            Ok(()) => {
                debug!(
                    target: "renderer::download",
                    hash = %entry.hash,
                    file = %entry.filename.display(),
                    "frame downloaded"
                );
                self.emit(DownloadEvent::Downloaded(entry.hash));
            }
            Err(error) => {
                warn!(
                    target: "renderer::download",
                    hash = %entry.hash,
                    file = %entry.filename.display(),
                    %error,
                    "failed to export frame"
                );
                self.emit(DownloadEvent::Failed {
                    hash: entry.hash,
                    filename: entry.filename,
                    error,
                });
            }
        }
    }

    /// Reads `texture` into `buffer` through `framebuffer`. The framebuffer is
    /// detached and unbound again whatever the read returns.
    fn download(
        &mut self,
        framebuffer: FramebufferId,
        texture: &TextureHandle,
        buffer: &mut [u8],
    ) -> Result<(), RendererError> {
        self.context.bind_read_framebuffer(Some(framebuffer));
        let read = self.context.attach_texture(Some(texture)).and_then(|()| {
            self.context
                .read_pixels(self.params.width, self.params.height, &self.format_info, buffer)
        });
        let detach = self.context.attach_texture(None);
        self.context.bind_read_framebuffer(None);
        read.and(detach)
    }

    fn emit(&self, event: DownloadEvent) {
        if self.events.send(event).is_err() {
            warn!(target: "renderer::download", "download event receiver dropped");
        }
    }
}
