//! wgpu-backed device memory.
//!
//! Device buffers are plain storage buffers. Host-to-device copies go through
//! `Queue::write_buffer`; device-to-host copies gather rows into a
//! `MAP_READ` staging buffer and map it once.

use crate::error::{HaloError, Result};

/// Copies and buffer sizes must be multiples of this many bytes.
pub const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// Row pitch alignment for pitched allocations.
pub const PITCH_ALIGN: usize = 256;

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
}

impl WgpuDevice {
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| HaloError::Device("no GPU adapter found".into()))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("halocline_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| HaloError::Device(format!("failed to get GPU device: {e}")))?;

        Ok(Self {
            device,
            queue,
            adapter_name,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn create_buffer(&self, size: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halocline_grid"),
            size: align_up(size as u64),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Queue a host-to-device write of each `(byte offset, data)` row.
    pub fn write_rows<'a>(
        &self,
        buffer: &wgpu::Buffer,
        rows: impl IntoIterator<Item = (usize, &'a [u8])>,
    ) -> Result<()> {
        for (offset, data) in rows {
            check_aligned(offset, data.len())?;
            self.queue.write_buffer(buffer, offset as u64, data);
        }
        Ok(())
    }

    /// Read `(byte offset, len)` rows into `dst`, packed back to back.
    pub fn read_rows(&self, buffer: &wgpu::Buffer, rows: &[(usize, usize)], dst: &mut [u8]) -> Result<()> {
        let total: usize = rows.iter().map(|&(_, len)| len).sum();
        if total == 0 {
            return Ok(());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halocline_read_staging"),
            size: align_up(total as u64),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let mut packed = 0u64;
        for &(offset, len) in rows {
            check_aligned(offset, len)?;
            encoder.copy_buffer_to_buffer(buffer, offset as u64, &staging, packed, len as u64);
            packed += len as u64;
        }
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        self.wait();
        receiver
            .recv()
            .map_err(|e| HaloError::Device(format!("readback channel closed: {e}")))?
            .map_err(|e| HaloError::Device(format!("buffer map failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            dst[..total].copy_from_slice(&data[..total]);
        }
        staging.unmap();
        Ok(())
    }

    /// Block until every submitted copy has completed.
    pub fn wait(&self) {
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });
    }
}

fn align_up(n: u64) -> u64 {
    n.div_ceil(COPY_ALIGN) * COPY_ALIGN
}

fn check_aligned(offset: usize, len: usize) -> Result<()> {
    if offset as u64 % COPY_ALIGN != 0 || len as u64 % COPY_ALIGN != 0 {
        return Err(HaloError::Device(format!(
            "unaligned device copy: offset {offset}, length {len} (alignment {COPY_ALIGN})"
        )));
    }
    Ok(())
}
