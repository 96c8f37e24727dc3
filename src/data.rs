use rayon::prelude::*;

#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T> Grid<T>
where
    T: Clone,
{
    pub fn new(width: usize, height: usize, default_value: T) -> Grid<T> {
        let data = vec![default_value; width * height];
        Grid {
            width,
            height,
            data,
        }
    }
}

impl<T> Grid<T> {
    /// Wraps a row-major buffer; returns `None` if its length is not `width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Option<Grid<T>> {
        if data.len() != width * height {
            return None;
        }
        Some(Grid {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn val(&self, x: usize, y: usize) -> &T {
        assert!(x < self.width && y < self.height, "Index out of bounds");
        &self.data[self.width * y + x]
    }

    pub fn as_slice(&self) -> &[T] {
        self.data.as_slice()
    }
}

impl<T> Grid<T>
where
    T: Send + Sync,
{
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = (usize, &mut [T])> {
        // A zero-width grid has no rows, but par_chunks_mut rejects a zero chunk size.
        let chunk_size = self.width.max(1);
        self.data.par_chunks_mut(chunk_size).enumerate()
    }
}
