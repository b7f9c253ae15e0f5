//! Device context and storage-buffer primitives.

use anyhow::{Result, anyhow};
use wgpu::util::DeviceExt;

/// Headless compute device: one adapter, one device, one queue.
///
/// All kernel dispatches are recorded in their own compute pass and submitted
/// on this single queue, so storage writes of one dispatch are visible to
/// every later dispatch without further synchronization.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("no compute-capable adapter: {e}"))?;

        let info = adapter.get_info();
        log::info!("GPU adapter: {} ({:?})", info.name, info.backend);

        // Weight buffers can exceed the default 128 MiB binding limit on
        // larger checkpoints; take whatever the adapter offers.
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter.limits().max_storage_buffer_binding_size,
            max_buffer_size: adapter.limits().max_buffer_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("glowinfer"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| anyhow!("request_device failed: {e}"))?;

        Ok(Self { device, queue })
    }

    /// Block until every submitted dispatch has completed.
    pub fn sync(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| anyhow!("device poll failed: {e}"))?;
        Ok(())
    }

    /// Enqueue a buffer-to-buffer copy; offsets and length are in bytes.
    pub fn copy_buffer(
        &self,
        src: &GpuBuffer,
        src_offset: u64,
        dst: &GpuBuffer,
        dst_offset: u64,
        bytes: u64,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("buffer copy"),
            });
        encoder.copy_buffer_to_buffer(&src.buffer, src_offset, &dst.buffer, dst_offset, bytes);
        self.queue.submit(Some(encoder.finish()));
    }

    /// Read the first `bytes` of a storage buffer through a staging copy.
    /// Blocks until prior dispatches have finished.
    pub fn read_buffer(&self, src: &GpuBuffer, bytes: u64) -> Result<Vec<u8>> {
        let align = wgpu::MAP_ALIGNMENT.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let padded = bytes.div_ceil(align) * align;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &staging, 0, bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(0..bytes);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.sync()?;
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(anyhow!("map_async failed: {e}")),
            Err(_) => return Err(anyhow!("map_async callback dropped")),
        }

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}

/// A GPU storage buffer with its logical length (in 4-byte words) recorded
/// alongside the handle.
pub struct GpuBuffer {
    pub buffer: wgpu::Buffer,
    pub len: usize,
}

impl GpuBuffer {
    /// Upload a byte image as an immutable storage buffer.
    pub fn from_bytes(ctx: &GpuContext, label: &str, bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len() % 4, 0, "storage buffers hold 4-byte words");
        let buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        Self {
            buffer,
            len: bytes.len() / 4,
        }
    }

    pub fn from_f32(ctx: &GpuContext, label: &str, data: &[f32]) -> Self {
        Self::from_bytes(ctx, label, bytemuck::cast_slice(data))
    }

    /// Allocate a zero-filled storage buffer of `len` words.
    pub fn zeroed(ctx: &GpuContext, label: &str, len: usize) -> Self {
        let align = wgpu::MAP_ALIGNMENT.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let size = ((len * 4) as u64).div_ceil(align) * align;
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Self { buffer, len }
    }

    /// Host-to-GPU sub-range update starting at word `word_offset`.
    pub fn write(&self, ctx: &GpuContext, word_offset: usize, bytes: &[u8]) {
        debug_assert!(word_offset * 4 + bytes.len() <= self.len * 4);
        ctx.queue
            .write_buffer(&self.buffer, (word_offset * 4) as u64, bytes);
    }

    pub fn read_f32(&self, ctx: &GpuContext, count: usize) -> Result<Vec<f32>> {
        let bytes = ctx.read_buffer(self, (count * 4) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn read_u32(&self, ctx: &GpuContext, count: usize) -> Result<Vec<u32>> {
        let bytes = ctx.read_buffer(self, (count * 4) as u64)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}
