//! Flow-cell layout — deterministic channel→region assignment.
//!
//! The flow cell is a rows × cols grid of channels. Splitting along axis 1
//! divides the columns into equal contiguous groups, axis 0 the rows. The
//! assignment is a pure function of (layout, axis, region count), so the same
//! configuration always produces the same partition.
//!
//! Real devices number their channels through a vendor-specific permutation;
//! when one is available out-of-band it can be injected with
//! [`FlowcellLayout::with_permutation`]. Without one, PromethION-sized flow
//! cells use the published block numbering and everything else falls back to
//! a row-major grid.

use crate::error::ConfigProblems;

/// Axis along which the flow cell is split into regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    /// Split rows into contiguous groups (top/bottom).
    Rows,
    /// Split columns into contiguous groups (left/right).
    Cols,
}

impl SplitAxis {
    /// The TOML encoding: 0 = rows, 1 = cols (the default).
    pub fn from_index(i: i64) -> Option<SplitAxis> {
        match i {
            0 => Some(SplitAxis::Rows),
            1 => Some(SplitAxis::Cols),
            _ => None,
        }
    }

    pub fn index(&self) -> i64 {
        match self {
            SplitAxis::Rows => 0,
            SplitAxis::Cols => 1,
        }
    }
}

impl Default for SplitAxis {
    fn default() -> Self {
        SplitAxis::Cols
    }
}

// ---------------------------------------------------------------------------
// FlowcellLayout
// ---------------------------------------------------------------------------

/// Grid geometry plus the channel→(row, col) mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowcellLayout {
    rows: usize,
    cols: usize,
    /// `permutation[channel - 1] = (row, col)`; `None` means computed.
    permutation: Option<Vec<(usize, usize)>>,
}

impl FlowcellLayout {
    /// Layout for a channel count, using the known device geometries
    /// (MinION 512 → 16×32, PromethION 3000 → 25×120) or the squarest
    /// row-major grid for anything else.
    pub fn for_channel_count(channels: usize) -> Result<FlowcellLayout, String> {
        if channels == 0 {
            return Err("channel count must be positive".into());
        }
        let (rows, cols) = match channels {
            512 => (16, 32),
            3000 => (25, 120),
            n => squarest_grid(n),
        };
        Ok(FlowcellLayout {
            rows,
            cols,
            permutation: None,
        })
    }

    /// Explicit geometry, e.g. from an instrument that reports its own.
    pub fn with_dimensions(rows: usize, cols: usize) -> Result<FlowcellLayout, String> {
        if rows == 0 || cols == 0 {
            return Err("flow cell dimensions must be positive".into());
        }
        Ok(FlowcellLayout {
            rows,
            cols,
            permutation: None,
        })
    }

    /// Inject a vendor permutation table: `table[channel - 1] = (row, col)`.
    pub fn with_permutation(
        self,
        table: Vec<(usize, usize)>,
    ) -> Result<FlowcellLayout, String> {
        if table.len() != self.channel_count() {
            return Err(format!(
                "permutation table has {} entries for {} channels",
                table.len(),
                self.channel_count()
            ));
        }
        if let Some(&(r, c)) = table.iter().find(|&&(r, c)| r >= self.rows || c >= self.cols) {
            return Err(format!(
                "permutation entry ({r}, {c}) is outside the {}x{} grid",
                self.rows, self.cols
            ));
        }
        Ok(FlowcellLayout {
            permutation: Some(table),
            ..self
        })
    }

    pub fn channel_count(&self) -> usize {
        self.rows * self.cols
    }

    /// (row, col) for a 1-based channel number.
    pub fn coords(&self, channel: u32) -> Option<(usize, usize)> {
        let idx = (channel as usize).checked_sub(1)?;
        if idx >= self.channel_count() {
            return None;
        }
        if let Some(table) = &self.permutation {
            return Some(table[idx]);
        }
        match self.channel_count() {
            // PromethION: channels run in blocks of 250 (25 rows of 10
            // columns), twelve blocks left to right.
            3000 => {
                let block = idx / 250;
                let rem = idx % 250;
                Some((rem / 10, rem % 10 + block * 10))
            }
            _ => Some((idx / self.cols, idx % self.cols)),
        }
    }

    /// Region index in `[0, regions)` for every channel, or the validation
    /// problems if the split does not divide the chosen axis.
    pub fn region_map(
        &self,
        regions: usize,
        axis: SplitAxis,
    ) -> Result<Vec<usize>, ConfigProblems> {
        let mut problems = ConfigProblems::default();
        if regions == 0 {
            problems.push("regions", "at least one region is required");
            return Err(problems);
        }
        let dim = match axis {
            SplitAxis::Rows => self.rows,
            SplitAxis::Cols => self.cols,
        };
        if dim % regions != 0 {
            problems.push(
                "regions",
                format!(
                    "{} region(s) cannot evenly split {} {} (axis {})",
                    regions,
                    dim,
                    match axis {
                        SplitAxis::Rows => "rows",
                        SplitAxis::Cols => "columns",
                    },
                    axis.index()
                ),
            );
            return Err(problems);
        }
        let group = dim / regions;
        let map = (1..=self.channel_count() as u32)
            .map(|ch| {
                let (row, col) = self.coords(ch).expect("channel within layout");
                match axis {
                    SplitAxis::Rows => row / group,
                    SplitAxis::Cols => col / group,
                }
            })
            .collect();
        Ok(map)
    }

    /// ASCII sketch of one region's footprint: `#` where the region applies,
    /// `.` elsewhere. Rendered at most 64 columns wide.
    pub fn draw_region(&self, region_map: &[usize], region: usize) -> String {
        let step = (self.cols + 63) / 64;
        let mut out = String::new();
        for row in 0..self.rows {
            out.push_str("    ");
            for col in (0..self.cols).step_by(step.max(1)) {
                let ch = self.channel_at(row, col);
                let mark = match ch.and_then(|c| region_map.get(c as usize - 1)) {
                    Some(&r) if r == region => '#',
                    Some(_) => '.',
                    None => ' ',
                };
                out.push(mark);
            }
            out.push('\n');
        }
        out
    }

    fn channel_at(&self, row: usize, col: usize) -> Option<u32> {
        // Inverse of coords(); only needed for drawing, so a scan is fine
        // for permuted layouts.
        if self.permutation.is_some() || self.channel_count() == 3000 {
            (1..=self.channel_count() as u32).find(|&ch| self.coords(ch) == Some((row, col)))
        } else {
            Some((row * self.cols + col) as u32 + 1)
        }
    }
}

/// The most-square (rows, cols) factorisation with rows <= cols.
fn squarest_grid(n: usize) -> (usize, usize) {
    let mut rows = (n as f64).sqrt() as usize;
    while rows > 1 && n % rows != 0 {
        rows -= 1;
    }
    (rows.max(1), n / rows.max(1))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_geometries() {
        assert_eq!(
            FlowcellLayout::for_channel_count(512).unwrap().channel_count(),
            512
        );
        let prom = FlowcellLayout::for_channel_count(3000).unwrap();
        assert_eq!(prom.channel_count(), 3000);
        // Block numbering: channel 251 starts the second block.
        assert_eq!(prom.coords(1), Some((0, 0)));
        assert_eq!(prom.coords(251), Some((0, 10)));
        assert_eq!(prom.coords(250), Some((24, 9)));
    }

    #[test]
    fn test_region_map_axis_cols() {
        let layout = FlowcellLayout::for_channel_count(512).unwrap();
        let map = layout.region_map(2, SplitAxis::Cols).unwrap();
        // Row-major 16x32: channel 1 is col 0 (left half), channel 32 col 31.
        assert_eq!(map[0], 0);
        assert_eq!(map[31], 1);
        assert_eq!(map.len(), 512);
        // Every channel is assigned, each region gets half.
        assert_eq!(map.iter().filter(|&&r| r == 0).count(), 256);
    }

    #[test]
    fn test_region_map_axis_rows() {
        let layout = FlowcellLayout::for_channel_count(512).unwrap();
        let map = layout.region_map(4, SplitAxis::Rows).unwrap();
        // Rows 0..4 -> region 0; channel 1 row 0, channel 512 row 15.
        assert_eq!(map[0], 0);
        assert_eq!(map[511], 3);
    }

    #[test]
    fn test_indivisible_split_is_an_error() {
        let layout = FlowcellLayout::for_channel_count(512).unwrap();
        let err = layout.region_map(5, SplitAxis::Cols).unwrap_err();
        assert!(err.0[0].reason.contains("5 region(s)"));
        assert!(err.0[0].reason.contains("columns"));
    }

    #[test]
    fn test_determinism() {
        let layout = FlowcellLayout::for_channel_count(512).unwrap();
        let a = layout.region_map(4, SplitAxis::Cols).unwrap();
        let b = layout.region_map(4, SplitAxis::Cols).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_permutation_round_trip() {
        let layout = FlowcellLayout::with_dimensions(2, 2).unwrap();
        // Reverse the numbering.
        let layout = layout
            .with_permutation(vec![(1, 1), (1, 0), (0, 1), (0, 0)])
            .unwrap();
        assert_eq!(layout.coords(1), Some((1, 1)));
        let map = layout.region_map(2, SplitAxis::Cols).unwrap();
        assert_eq!(map, vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_bad_permutation_rejected() {
        let layout = FlowcellLayout::with_dimensions(2, 2).unwrap();
        assert!(layout.clone().with_permutation(vec![(0, 0)]).is_err());
        assert!(layout
            .with_permutation(vec![(0, 0), (0, 1), (1, 0), (5, 5)])
            .is_err());
    }

    #[test]
    fn test_squarest_grid() {
        assert_eq!(squarest_grid(512), (16, 32));
        assert_eq!(squarest_grid(126), (9, 14));
        assert_eq!(squarest_grid(7), (1, 7));
    }

    #[test]
    fn test_draw_region_marks_half() {
        let layout = FlowcellLayout::with_dimensions(2, 4).unwrap();
        let map = layout.region_map(2, SplitAxis::Cols).unwrap();
        let art = layout.draw_region(&map, 0);
        assert!(art.contains("##.."));
    }
}
