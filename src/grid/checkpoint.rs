//! Checkpointing of the local partition.
//!
//! The stream format is the packed element bytes of the current buffer,
//! dimension 0 fastest, with no header. Restoring into a grid of a
//! different shape is the caller's mistake to avoid.

use std::io::{Read, Write};

use super::Grid;
use crate::error::Result;

impl Grid {
    /// Write the local partition to `w` and release the grid's buffers.
    /// The grid holds no data until [`Grid::restore`] is called; element
    /// access, copies and halo exchange fail with `NoBuffers` until then.
    ///
    /// Only the current buffer is written. With double buffering the other
    /// buffer is dropped.
    pub fn save<W: Write>(&mut self, w: &mut W) -> Result<()> {
        tracing::debug!(grid = self.id, bytes = self.local_bytes(), "saving grid");
        if self.empty {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.local_bytes()];
        self.copyout_local(&mut bytes)?;
        w.write_all(&bytes)?;
        self.delete_buffers();
        Ok(())
    }

    /// Reallocate the grid's buffers and fill the local partition from `r`.
    /// The data lands in buffer 0, which becomes the current buffer. Any
    /// second buffer starts zeroed and received halos are gone.
    pub fn restore<R: Read>(&mut self, r: &mut R) -> Result<()> {
        tracing::debug!(grid = self.id, bytes = self.local_bytes(), "restoring grid");
        self.delete_buffers();
        self.init_buffers()?;
        if self.empty {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.local_bytes()];
        r.read_exact(&mut bytes)?;
        self.copyin_local(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::device::DeviceContext;
    use crate::element::{ElementType, ReduceOp};
    use crate::error::HaloError;
    use crate::grid::{Grid, GridShape};
    use crate::index::IndexArray;

    #[test]
    fn save_then_restore_is_identity() {
        let size = IndexArray::new(5, 3, 2);
        let shape = GridShape::new(ElementType::Long, 3, size);
        let mut g = Grid::create(3, &shape, IndexArray::default(), size, DeviceContext::emulated()).unwrap();
        let values: Vec<i64> = (0..30).map(|v| v * 7 - 11).collect();
        g.copyin_local_typed(&values).unwrap();

        let mut stream = Vec::new();
        g.save(&mut stream).unwrap();
        assert_eq!(stream.len(), 30 * 8);

        g.restore(&mut Cursor::new(stream)).unwrap();
        assert_eq!(g.copyout_local_typed::<i64>().unwrap(), values);
    }

    #[test]
    fn saved_grid_fails_instead_of_panicking() {
        let size = IndexArray::new(4, 3, 1);
        let shape = GridShape::new(ElementType::Float, 2, size);
        let mut g = Grid::create(4, &shape, IndexArray::default(), size, DeviceContext::emulated()).unwrap();
        let mut stream = Vec::new();
        g.save(&mut stream).unwrap();

        let no_buffers = |r: Result<_, HaloError>| matches!(r, Err(HaloError::NoBuffers(4)));
        assert!(no_buffers(g.copyout_halo(0, 1, true, false).map(|_| ())));
        assert!(no_buffers(g.copyout_halo(1, 1, false, true).map(|_| ())));
        assert!(no_buffers(g.read_element::<f32>(&IndexArray::new(1, 1, 0)).map(|_| ())));
        assert!(no_buffers(g.write_element(&IndexArray::new(1, 1, 0), 2.0f32)));
        assert!(no_buffers(g.copyout_local_typed::<f32>().map(|_| ())));
        assert!(no_buffers(g.reduce_local(ReduceOp::Sum).map(|_| ())));

        g.restore(&mut Cursor::new(stream)).unwrap();
        assert_eq!(g.copyout_halo(0, 1, true, false).unwrap(), 3 * 4);
    }

    #[test]
    fn double_buffered_save_keeps_the_current_buffer() {
        let size = IndexArray::new(4, 1, 1);
        let shape = GridShape::new(ElementType::Int, 1, size).with_double_buffering(true);
        let mut g = Grid::create(5, &shape, IndexArray::default(), size, DeviceContext::emulated()).unwrap();
        g.copyin_local_typed(&[1i32, 2, 3, 4]).unwrap();
        g.swap_buffers();
        g.copyin_local_typed(&[5i32, 6, 7, 8]).unwrap();
        assert_eq!(g.current_buffer(), 1);

        let mut stream = Vec::new();
        g.save(&mut stream).unwrap();
        assert_eq!(stream.len(), 4 * 4);
        g.restore(&mut Cursor::new(stream)).unwrap();

        assert_eq!(g.current_buffer(), 0);
        assert_eq!(g.copyout_local_typed::<i32>().unwrap(), vec![5, 6, 7, 8]);
        g.swap_buffers();
        assert_eq!(g.copyout_local_typed::<i32>().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn truncated_stream_fails() {
        let size = IndexArray::new(4, 1, 1);
        let shape = GridShape::new(ElementType::Float, 1, size);
        let mut g = Grid::create(0, &shape, IndexArray::default(), size, DeviceContext::emulated()).unwrap();
        let err = g.restore(&mut Cursor::new(vec![0u8; 6]));
        assert!(matches!(err, Err(HaloError::Io(_))));
    }
}
