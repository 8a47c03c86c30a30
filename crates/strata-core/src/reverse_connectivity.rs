//! Point-to-cell (reverse) connectivity from cell-to-point connectivity.
//!
//! The builder runs three passes over the flat connectivity array:
//!
//! ```text
//!   connectivity ──histogram──► counts[point]          (atomic add per entry)
//!   counts ───exclusive scan──► offsets[point]         (total must equal entries)
//!   counts = 0; per entry: slot = offsets[point] + counts.add(point, 1)
//!                          rconn[slot] = owning cell
//! ```
//!
//! Cells sharing a point land in its slice in no particular order, and a
//! point listed twice by one cell appears twice.

use strata_backends::adapters::general::upper_bound_index;
use strata_backends::{DeviceAdapter, ErrorMessageBuffer, Id, Kernel, ReadPortal, WritePortal};
use strata_tracing::perf_span;

use crate::algorithm::Algorithm;
use crate::array_handle::ArrayHandle;
use crate::atomic_array::AtomicArray;
use crate::error::{Error, Result};

/// Maps an entry number `0..entries` to its index in the connectivity array.
pub trait ConnectivityIndexMap: Sync {
    fn conn_index(&self, entry: Id) -> Id;
}

impl<F: Fn(Id) -> Id + Sync> ConnectivityIndexMap for F {
    #[inline]
    fn conn_index(&self, entry: Id) -> Id {
        self(entry)
    }
}

/// Maps a connectivity index to the id of the cell that owns it.
pub trait CellIdMap: Sync {
    fn cell_id(&self, conn_index: Id) -> Id;
}

impl<F: Fn(Id) -> Id + Sync> CellIdMap for F {
    #[inline]
    fn cell_id(&self, conn_index: Id) -> Id {
        self(conn_index)
    }
}

/// Every connectivity value is a point id
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ConnectivityIndexMap for PassThrough {
    #[inline]
    fn conn_index(&self, entry: Id) -> Id {
        entry
    }
}

/// Cells of one shape with a fixed number of points each
#[derive(Debug, Clone, Copy)]
pub struct SingleTypeCells {
    pub points_per_cell: Id,
}

impl CellIdMap for SingleTypeCells {
    #[inline]
    fn cell_id(&self, conn_index: Id) -> Id {
        conn_index / self.points_per_cell
    }
}

/// Interleaved `[n, p0, .., pn-1, n, ..]` cell array with fixed `n`
#[derive(Debug, Clone, Copy)]
pub struct LegacyCellArray {
    pub points_per_cell: Id,
}

impl ConnectivityIndexMap for LegacyCellArray {
    #[inline]
    fn conn_index(&self, entry: Id) -> Id {
        // skip the count that leads every cell
        entry + entry / self.points_per_cell + 1
    }
}

impl CellIdMap for LegacyCellArray {
    #[inline]
    fn cell_id(&self, conn_index: Id) -> Id {
        conn_index / (self.points_per_cell + 1)
    }
}

/// Mixed cells described by offsets into the connectivity (`cells + 1` values)
#[derive(Debug, Clone)]
pub struct ExplicitCells {
    offsets: ReadPortal<Id>,
}

impl ExplicitCells {
    pub fn new(offsets: ReadPortal<Id>) -> Self {
        Self { offsets }
    }
}

impl CellIdMap for ExplicitCells {
    fn cell_id(&self, conn_index: Id) -> Id {
        upper_bound_index(&self.offsets, conn_index, &|a: Id, b: Id| a < b) - 1
    }
}

struct BuildHistogram<'a, I> {
    connectivity: ReadPortal<Id>,
    counts: &'a AtomicArray<i32>,
    index_map: &'a I,
}

impl<I: ConnectivityIndexMap> Kernel for BuildHistogram<'_, I> {
    fn invoke(&self, entry: Id, errors: &ErrorMessageBuffer) {
        let Some(point) = point_of(&self.connectivity, self.index_map, self.counts.len(), entry, errors) else {
            return;
        };
        self.counts.add(point, 1);
    }
}

struct GenerateReverseConnectivity<'a, I, C> {
    connectivity: ReadPortal<Id>,
    offsets: ReadPortal<Id>,
    counts: &'a AtomicArray<i32>,
    reverse: WritePortal<Id>,
    index_map: &'a I,
    cell_map: &'a C,
}

impl<I: ConnectivityIndexMap, C: CellIdMap> Kernel for GenerateReverseConnectivity<'_, I, C> {
    fn invoke(&self, entry: Id, errors: &ErrorMessageBuffer) {
        let Some(point) = point_of(&self.connectivity, self.index_map, self.counts.len(), entry, errors) else {
            return;
        };
        let conn = self.index_map.conn_index(entry);
        let slot = self.offsets.get(point) + Id::from(self.counts.add(point, 1));
        self.reverse.set(slot, self.cell_map.cell_id(conn));
    }
}

fn point_of<I: ConnectivityIndexMap>(
    connectivity: &ReadPortal<Id>,
    index_map: &I,
    num_points: Id,
    entry: Id,
    errors: &ErrorMessageBuffer,
) -> Option<Id> {
    let conn = index_map.conn_index(entry);
    if conn < 0 || conn >= connectivity.len() {
        errors.raise(format!(
            "entry {entry} maps to connectivity index {conn} outside 0..{}",
            connectivity.len()
        ));
        return None;
    }
    let point = connectivity.get(conn);
    if point < 0 || point >= num_points {
        errors.raise(format!("connectivity index {conn} refers to point {point} outside 0..{num_points}"));
        return None;
    }
    Some(point)
}

/// Cells incident to each point
#[derive(Debug, Clone)]
pub struct ReverseConnectivity {
    /// Cell ids grouped by point
    pub connectivity: ArrayHandle<Id>,
    /// Number of cells per point
    pub num_indices: ArrayHandle<Id>,
    /// Start of each point's slice in `connectivity`
    pub offsets: ArrayHandle<Id>,
}

impl ReverseConnectivity {
    pub fn num_points(&self) -> Id {
        self.offsets.len()
    }

    /// Cells using `point`, in storage order.
    pub fn point_cells(&self, point: Id) -> Result<Vec<Id>> {
        let start = self.offsets.get_value(point)?;
        let count = self.num_indices.get_value(point)?;
        let cells = self.connectivity.read_portal()?;
        Ok((start..start + count).map(|slot| cells.get(slot)).collect())
    }
}

pub struct ReverseConnectivityBuilder;

impl ReverseConnectivityBuilder {
    /// Build the reverse connectivity of `entries` connectivity values
    /// referring to points `0..num_points`.
    pub fn run<D, I, C>(
        device: &D,
        connectivity: &ArrayHandle<Id>,
        index_map: &I,
        cell_map: &C,
        num_points: Id,
        entries: Id,
    ) -> Result<ReverseConnectivity>
    where
        D: DeviceAdapter,
        I: ConnectivityIndexMap,
        C: CellIdMap,
    {
        if num_points < 0 || entries < 0 {
            return Err(Error::bad_value(format!(
                "reverse connectivity needs non-negative sizes, got {num_points} points and {entries} entries"
            )));
        }
        let _span = perf_span!(
            "reverse_connectivity",
            device = tracing::field::display(device.id()),
            points = num_points,
            entries = entries
        );
        let algorithm = Algorithm::new(device.clone());
        let conn = connectivity.prepare_for_input(device)?;

        let counts = ArrayHandle::<i32>::new();
        algorithm.fill(&counts, 0, num_points)?;
        {
            let atomic = AtomicArray::new(&counts, device)?;
            let histogram = BuildHistogram {
                connectivity: conn.clone(),
                counts: &atomic,
                index_map,
            };
            device.schedule_kernel(&histogram, entries)?;
        }

        let num_indices = ArrayHandle::new();
        let offsets = ArrayHandle::new();
        algorithm.copy_as(&counts, &num_indices)?;
        let total = algorithm.scan_exclusive(&num_indices, &offsets)?;
        if total != entries {
            return Err(Error::bad_value(format!(
                "histogram counted {total} entries, expected {entries}"
            )));
        }

        algorithm.fill(&counts, 0, num_points)?;
        let reverse = ArrayHandle::new();
        {
            let atomic = AtomicArray::new(&counts, device)?;
            let generate = GenerateReverseConnectivity {
                connectivity: conn,
                offsets: offsets.prepare_for_input(device)?,
                counts: &atomic,
                reverse: reverse.prepare_for_output(entries, device)?,
                index_map,
                cell_map,
            };
            device.schedule_kernel(&generate, entries)?;
        }

        tracing::debug!(device = %device.id(), num_points, entries, "built reverse connectivity");
        Ok(ReverseConnectivity {
            connectivity: reverse,
            num_indices,
            offsets,
        })
    }

    /// Cells that all have `points_per_cell` points, stored back to back.
    pub fn build_single_type<D: DeviceAdapter>(
        device: &D,
        connectivity: &ArrayHandle<Id>,
        points_per_cell: Id,
        num_points: Id,
    ) -> Result<ReverseConnectivity> {
        ensure_points_per_cell(points_per_cell)?;
        Self::run(
            device,
            connectivity,
            &PassThrough,
            &SingleTypeCells { points_per_cell },
            num_points,
            connectivity.len(),
        )
    }

    /// Cells delimited by `cell_offsets` (one more value than cells).
    pub fn build_explicit<D: DeviceAdapter>(
        device: &D,
        connectivity: &ArrayHandle<Id>,
        cell_offsets: &ArrayHandle<Id>,
        num_points: Id,
    ) -> Result<ReverseConnectivity> {
        let offsets = cell_offsets.prepare_for_input(device)?;
        if offsets.is_empty() || offsets.get(offsets.len() - 1) != connectivity.len() {
            return Err(Error::bad_value(format!(
                "cell offsets must end at the connectivity length {}",
                connectivity.len()
            )));
        }
        Self::run(
            device,
            connectivity,
            &PassThrough,
            &ExplicitCells::new(offsets),
            num_points,
            connectivity.len(),
        )
    }

    /// Interleaved cell array of `num_cells` cells with `points_per_cell` points each.
    pub fn build_legacy<D: DeviceAdapter>(
        device: &D,
        cells: &ArrayHandle<Id>,
        points_per_cell: Id,
        num_cells: Id,
        num_points: Id,
    ) -> Result<ReverseConnectivity> {
        ensure_points_per_cell(points_per_cell)?;
        if num_cells < 0 || num_cells * (points_per_cell + 1) != cells.len() {
            return Err(Error::bad_value(format!(
                "{num_cells} cells of {points_per_cell} points do not fill a cell array of {} values",
                cells.len()
            )));
        }
        let layout = LegacyCellArray { points_per_cell };
        Self::run(device, cells, &layout, &layout, num_points, num_cells * points_per_cell)
    }
}

fn ensure_points_per_cell(points_per_cell: Id) -> Result<()> {
    if points_per_cell <= 0 {
        return Err(Error::bad_value(format!(
            "points per cell must be positive, got {points_per_cell}"
        )));
    }
    Ok(())
}
