//! Fixed-size automaton grid with a toroidal auxiliary border.
//!
//! Cells are stored with one extra ring of "auxiliary" cells around the visible
//! `width × height` area. Before every step the ring is refreshed from the opposite edges
//! ([`Grid::wrap_borders`]), so neighborhood lookups never branch on position: every visible cell,
//! including edges and corners, reads its eight neighbors straight out of the padded buffer.

use thiserror::Error;

/// State of a single cell (`0..state_count`).
pub type Cell = u8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("grid dimensions must be positive (got {width}x{height})")]
    EmptyDimensions { width: usize, height: usize },

    #[error("content length {actual} does not match grid size {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("cell ({x}, {y}) is outside a {width}x{height} grid")]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },

    #[error("cell {index} has state {state}, state count is {state_count}")]
    StateOutOfRange {
        index: usize,
        state: Cell,
        state_count: u16,
    },
}

/// Moore neighborhood of one cell.
///
/// `neighbors` is ordered row by row, skipping the center: NW, N, NE, W, E, SW, S, SE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighborhood {
    pub center: Cell,
    pub neighbors: [Cell; 8],
}

impl Neighborhood {
    /// Number of neighbors in `state`.
    pub fn count(&self, state: Cell) -> usize {
        self.neighbors.iter().filter(|&&c| c == state).count()
    }

    /// Number of neighbors in any non-zero state.
    pub fn live(&self) -> usize {
        self.neighbors.iter().filter(|&&c| c != 0).count()
    }
}

/// Offsets of the eight neighbors, in [`Neighborhood::neighbors`] order.
const OFFSETS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<Cell>,
}

impl Grid {
    /// All-zero grid.
    pub fn new(width: usize, height: usize) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::EmptyDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            cells: vec![0; (width + 2) * (height + 2)],
        })
    }

    /// Rebuild a grid from its row-major serialized form.
    pub fn from_bytes(width: usize, height: usize, content: &[u8]) -> Result<Self, GridError> {
        let mut grid = Self::new(width, height)?;
        let expected = width * height;
        if content.len() != expected {
            return Err(GridError::LengthMismatch {
                expected,
                actual: content.len(),
            });
        }
        for (y, row) in content.chunks_exact(width).enumerate() {
            let start = grid.offset(0, y);
            grid.cells[start..start + width].copy_from_slice(row);
        }
        Ok(grid)
    }

    /// Row-major flattening of the visible cells (`width * height` bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            let start = self.offset(0, y);
            out.extend_from_slice(&self.cells[start..start + self.width]);
        }
        out
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Cell> {
        (x < self.width && y < self.height).then(|| self.cells[self.offset(x, y)])
    }

    pub fn set(&mut self, x: usize, y: usize, cell: Cell) -> Result<(), GridError> {
        if x >= self.width || y >= self.height {
            return Err(GridError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        let idx = self.offset(x, y);
        self.cells[idx] = cell;
        Ok(())
    }

    /// Ensure every visible cell is a valid state for a simulation with `state_count` states.
    pub fn check_states(&self, state_count: u16) -> Result<(), GridError> {
        for y in 0..self.height {
            for x in 0..self.width {
                let state = self.cells[self.offset(x, y)];
                if u16::from(state) >= state_count {
                    return Err(GridError::StateOutOfRange {
                        index: y * self.width + x,
                        state,
                        state_count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Refresh the auxiliary ring from the opposite edges (wrap-around in both axes).
    pub fn wrap_borders(&mut self) {
        let (w, h) = (self.width as isize, self.height as isize);

        for x in 0..w {
            self.copy_cell((x, h - 1), (x, -1));
            self.copy_cell((x, 0), (x, h));
        }
        for y in 0..h {
            self.copy_cell((w - 1, y), (-1, y));
            self.copy_cell((0, y), (w, y));
        }

        self.copy_cell((w - 1, h - 1), (-1, -1));
        self.copy_cell((0, h - 1), (w, -1));
        self.copy_cell((w - 1, 0), (-1, h));
        self.copy_cell((0, 0), (w, h));
    }

    /// Neighborhood of a visible cell, read from the padded buffer.
    ///
    /// Reflects the border as of the last [`Grid::wrap_borders`] call.
    pub fn neighborhood(&self, x: usize, y: usize) -> Neighborhood {
        let (cx, cy) = (x as isize, y as isize);
        let mut neighbors = [0; 8];
        for (slot, (dx, dy)) in neighbors.iter_mut().zip(OFFSETS) {
            *slot = self.cells[self.padded_index(cx + dx, cy + dy)];
        }
        Neighborhood {
            center: self.cells[self.offset(x, y)],
            neighbors,
        }
    }

    /// Visible coordinates of the eight toroidal neighbors of `(x, y)`.
    pub fn toroidal_neighbors(&self, x: usize, y: usize) -> [(usize, usize); 8] {
        let (w, h) = (self.width as isize, self.height as isize);
        OFFSETS.map(|(dx, dy)| {
            (
                (x as isize + dx).rem_euclid(w) as usize,
                (y as isize + dy).rem_euclid(h) as usize,
            )
        })
    }

    fn offset(&self, x: usize, y: usize) -> usize {
        (y + 1) * (self.width + 2) + (x + 1)
    }

    /// Index into the padded buffer; `-1` and `width`/`height` address the auxiliary ring.
    fn padded_index(&self, x: isize, y: isize) -> usize {
        ((y + 1) as usize) * (self.width + 2) + (x + 1) as usize
    }

    fn copy_cell(&mut self, from: (isize, isize), to: (isize, isize)) {
        let value = self.cells[self.padded_index(from.0, from.1)];
        let idx = self.padded_index(to.0, to.1);
        self.cells[idx] = value;
    }
}
