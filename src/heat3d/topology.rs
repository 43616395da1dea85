//! Rank grid, sub-domain geometry and scratch-slot layout.

use crate::error::{Error, Result};
use std::fmt;

/// Bytes reserved in the scratch buffer for one rank's facet entry.
pub const SLOT_SIZE: usize = 1024;

/// Smallest sub-domain edge the stencil can split into facets and interior.
pub const MIN_POINTS_PER_SIDE: u32 = 3;

/// One face of a sub-domain. `U` faces sit at the high end of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Facet {
    XU = 0,
    XD = 1,
    YU = 2,
    YD = 3,
    ZU = 4,
    ZD = 5,
}

impl Facet {
    pub const COUNT: usize = 6;

    /// Every facet in the order halos are packed and sent.
    pub const ALL: [Facet; Facet::COUNT] = [
        Facet::XU,
        Facet::XD,
        Facet::YU,
        Facet::YD,
        Facet::ZU,
        Facet::ZD,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Facet> {
        Facet::ALL.get(index).copied()
    }

    /// The facet a neighbor sees across this one.
    pub fn opposite(self) -> Facet {
        let index = self.index();
        Facet::ALL[(index / 2) * 2 + ((index % 2) ^ 1)]
    }

    /// 0 for X, 1 for Y, 2 for Z.
    pub fn axis(self) -> usize {
        self.index() / 2
    }

    pub fn is_upper(self) -> bool {
        self.index() % 2 == 0
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Facet::XU => "XU",
            Facet::XD => "XD",
            Facet::YU => "YU",
            Facet::YD => "YD",
            Facet::ZU => "ZU",
            Facet::ZD => "ZD",
        };
        f.write_str(s)
    }
}

/// Byte offset of the slot where `rank` publishes the buffer for `facet`.
pub fn slot_offset(rank: u32, facet: Facet) -> usize {
    (Facet::COUNT * rank as usize + facet.index()) * SLOT_SIZE
}

/// Size of the scratch buffer holding every rank's slots.
pub fn scratch_len(n_ranks: u32) -> usize {
    Facet::COUNT * n_ranks as usize * SLOT_SIZE
}

/// Arrangement of ranks into an `nx * ny * nz` box, z varying fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGrid {
    nx: u32,
    ny: u32,
    nz: u32,
}

impl RankGrid {
    pub fn new(nx: u32, ny: u32, nz: u32) -> Result<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(Error::invalid_args(format!(
                "sub-domain counts must be positive, got {nx}x{ny}x{nz}"
            )));
        }
        nx.checked_mul(ny)
            .and_then(|v| v.checked_mul(nz))
            .ok_or_else(|| Error::invalid_args(format!("{nx}x{ny}x{nz} ranks overflow")))?;
        Ok(Self { nx, ny, nz })
    }

    pub fn dims(&self) -> [u32; 3] {
        [self.nx, self.ny, self.nz]
    }

    pub fn n_ranks(&self) -> u32 {
        self.nx * self.ny * self.nz
    }

    pub fn rank_of(&self, [x, y, z]: [u32; 3]) -> u32 {
        x * self.ny * self.nz + y * self.nz + z
    }

    pub fn coords_of(&self, rank: u32) -> [u32; 3] {
        let x = rank / (self.ny * self.nz);
        let y = (rank - x * self.ny * self.nz) / self.nz;
        let z = rank - x * self.ny * self.nz - y * self.nz;
        [x, y, z]
    }

    /// Periodic neighbor of `rank` across each facet, indexed by
    /// [`Facet::index`].
    pub fn neighbors(&self, rank: u32) -> [u32; Facet::COUNT] {
        let coords = self.coords_of(rank);
        let dims = self.dims();
        Facet::ALL.map(|facet| {
            let axis = facet.axis();
            let mut c = coords;
            c[axis] = if facet.is_upper() {
                (c[axis] + 1) % dims[axis]
            } else {
                (c[axis] + dims[axis] - 1) % dims[axis]
            };
            self.rank_of(c)
        })
    }
}

/// Inclusive point range along the three axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span3 {
    pub x: (u32, u32),
    pub y: (u32, u32),
    pub z: (u32, u32),
}

impl Span3 {
    fn axis_len((lo, hi): (u32, u32)) -> usize {
        if hi < lo {
            0
        } else {
            (hi - lo + 1) as usize
        }
    }

    pub fn len(&self) -> usize {
        Self::axis_len(self.x) * Self::axis_len(self.y) * Self::axis_len(self.z)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, [i, j, k]: [u32; 3]) -> bool {
        (self.x.0..=self.x.1).contains(&i)
            && (self.y.0..=self.y.1).contains(&j)
            && (self.z.0..=self.z.1).contains(&k)
    }

    /// Points in x-major, z-fastest order.
    pub fn points(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        let s = *self;
        (s.x.0..=s.x.1).flat_map(move |i| {
            (s.y.0..=s.y.1).flat_map(move |j| (s.z.0..=s.z.1).map(move |k| [i, j, k]))
        })
    }
}

/// Point ranges touched by the kernels for one facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacetRanges {
    /// Ghost layer filled from the neighbor's halo.
    pub outer: Span3,
    /// Boundary layer packed and sent to the neighbor.
    pub inner: Span3,
    /// The part of `inner` this facet updates; edges shared with an
    /// earlier facet are left to that facet.
    pub update: Span3,
}

/// One rank's block of the mesh, with a one-point ghost layer on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubDomain {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
}

impl SubDomain {
    /// Splits a cube of `mesh_length` points per side across `grid`.
    pub fn split(mesh_length: u32, grid: &RankGrid) -> Result<Self> {
        let [gx, gy, gz] = grid.dims();
        let sub = Self {
            nx: mesh_length / gx,
            ny: mesh_length / gy,
            nz: mesh_length / gz,
        };
        if sub.nx < MIN_POINTS_PER_SIDE || sub.ny < MIN_POINTS_PER_SIDE || sub.nz < MIN_POINTS_PER_SIDE {
            return Err(Error::invalid_args(format!(
                "mesh of {mesh_length} points splits into {}x{}x{} sub-domains, \
                 at least {MIN_POINTS_PER_SIDE} points per side are required",
                sub.nx, sub.ny, sub.nz
            )));
        }
        Ok(sub)
    }

    /// Number of points including the ghost layer.
    pub fn padded_len(&self) -> usize {
        (self.nx as usize + 2) * (self.ny as usize + 2) * (self.nz as usize + 2)
    }

    pub fn index(&self, [i, j, k]: [u32; 3]) -> usize {
        let (ny, nz) = (self.ny as usize + 2, self.nz as usize + 2);
        (i as usize * ny + j as usize) * nz + k as usize
    }

    /// Number of values in the halo for `facet`.
    pub fn facet_len(&self, facet: Facet) -> usize {
        let (nx, ny, nz) = (self.nx as usize, self.ny as usize, self.nz as usize);
        match facet.axis() {
            0 => ny * nz,
            1 => nx * nz,
            _ => nx * ny,
        }
    }

    pub fn interior(&self) -> Span3 {
        Span3 {
            x: (2, self.nx - 1),
            y: (2, self.ny - 1),
            z: (2, self.nz - 1),
        }
    }

    pub fn facet_ranges(&self, facet: Facet) -> FacetRanges {
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let full = Span3 {
            x: (1, nx),
            y: (1, ny),
            z: (1, nz),
        };
        let plane = |axis: usize, at: u32| {
            let mut span = full;
            match axis {
                0 => span.x = (at, at),
                1 => span.y = (at, at),
                _ => span.z = (at, at),
            }
            span
        };
        let (outer_at, inner_at) = match facet {
            Facet::XU => (nx + 1, nx),
            Facet::XD => (0, 1),
            Facet::YU => (ny + 1, ny),
            Facet::YD => (0, 1),
            Facet::ZU => (nz + 1, nz),
            Facet::ZD => (0, 1),
        };
        let axis = facet.axis();
        let inner = plane(axis, inner_at);
        let mut update = inner;
        if axis >= 1 {
            update.x = (2, nx - 1);
        }
        if axis == 2 {
            update.y = (2, ny - 1);
        }
        FacetRanges {
            outer: plane(axis, outer_at),
            inner,
            update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_opposite_facets() {
        assert_eq!(Facet::XU.opposite(), Facet::XD);
        assert_eq!(Facet::XD.opposite(), Facet::XU);
        assert_eq!(Facet::YU.opposite(), Facet::YD);
        assert_eq!(Facet::ZD.opposite(), Facet::ZU);
        for facet in Facet::ALL {
            assert_eq!(facet.opposite().opposite(), facet);
            assert_eq!(Facet::from_index(facet.index()), Some(facet));
        }
        assert_eq!(Facet::from_index(6), None);
    }

    #[test]
    fn test_rank_ordering_is_z_fastest() {
        let grid = RankGrid::new(2, 3, 4).unwrap();
        assert_eq!(grid.n_ranks(), 24);
        assert_eq!(grid.coords_of(0), [0, 0, 0]);
        assert_eq!(grid.coords_of(1), [0, 0, 1]);
        assert_eq!(grid.coords_of(4), [0, 1, 0]);
        assert_eq!(grid.coords_of(12), [1, 0, 0]);
        assert_eq!(grid.rank_of([1, 2, 3]), 23);
    }

    #[test]
    fn test_single_rank_neighbors_itself() {
        let grid = RankGrid::new(1, 1, 1).unwrap();
        assert_eq!(grid.neighbors(0), [0; 6]);
    }

    #[test]
    fn test_two_ranks_along_x() {
        let grid = RankGrid::new(2, 1, 1).unwrap();
        assert_eq!(grid.neighbors(0), [1, 1, 0, 0, 0, 0]);
        assert_eq!(grid.neighbors(1), [0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_zero_grid_rejected() {
        assert!(matches!(RankGrid::new(0, 1, 1), Err(Error::InvalidArgs(_))));
    }

    #[test]
    fn test_split_requires_three_points() {
        let grid = RankGrid::new(2, 1, 1).unwrap();
        assert!(matches!(SubDomain::split(5, &grid), Err(Error::InvalidArgs(_))));
        let sub = SubDomain::split(6, &grid).unwrap();
        assert_eq!((sub.nx, sub.ny, sub.nz), (3, 6, 6));
        assert_eq!(sub.padded_len(), 5 * 8 * 8);
    }

    #[test]
    fn test_facet_lengths_match_ranges() {
        let sub = SubDomain { nx: 4, ny: 5, nz: 6 };
        for facet in Facet::ALL {
            let ranges = sub.facet_ranges(facet);
            assert_eq!(ranges.outer.len(), sub.facet_len(facet), "{facet}");
            assert_eq!(ranges.inner.len(), sub.facet_len(facet), "{facet}");
        }
        assert_eq!(sub.facet_len(Facet::XU), 30);
        assert_eq!(sub.facet_len(Facet::YD), 24);
        assert_eq!(sub.facet_len(Facet::ZU), 20);
    }

    #[test]
    fn test_index_is_z_fastest() {
        let sub = SubDomain { nx: 3, ny: 3, nz: 3 };
        assert_eq!(sub.index([0, 0, 1]), 1);
        assert_eq!(sub.index([0, 1, 0]), 5);
        assert_eq!(sub.index([1, 0, 0]), 25);
        assert_eq!(sub.index([4, 4, 4]), sub.padded_len() - 1);
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(slot_offset(0, Facet::XU), 0);
        assert_eq!(slot_offset(0, Facet::ZD), 5 * SLOT_SIZE);
        assert_eq!(slot_offset(1, Facet::XU), 6 * SLOT_SIZE);
        assert_eq!(scratch_len(2), 12 * SLOT_SIZE);
        assert_eq!(slot_offset(1, Facet::ZD) + SLOT_SIZE, scratch_len(2));
    }

    proptest! {
        #[test]
        fn neighbors_are_symmetric(nx in 1u32..5, ny in 1u32..5, nz in 1u32..5, pick in 0u32..1000) {
            let grid = RankGrid::new(nx, ny, nz).unwrap();
            let rank = pick % grid.n_ranks();
            prop_assert_eq!(grid.rank_of(grid.coords_of(rank)), rank);
            let neighbors = grid.neighbors(rank);
            for facet in Facet::ALL {
                let neighbor = neighbors[facet.index()];
                prop_assert!(neighbor < grid.n_ranks());
                prop_assert_eq!(grid.neighbors(neighbor)[facet.opposite().index()], rank);
            }
        }

        #[test]
        fn slots_never_overlap(a in 0u32..64, fa in 0usize..6, b in 0u32..64, fb in 0usize..6) {
            prop_assume!((a, fa) != (b, fb));
            let x = slot_offset(a, Facet::ALL[fa]);
            let y = slot_offset(b, Facet::ALL[fb]);
            prop_assert!(x + SLOT_SIZE <= y || y + SLOT_SIZE <= x);
            prop_assert!(x + SLOT_SIZE <= scratch_len(a.max(b) + 1));
        }

        #[test]
        fn updates_cover_every_point_once(nx in 3u32..7, ny in 3u32..7, nz in 3u32..7) {
            let sub = SubDomain { nx, ny, nz };
            let mut hits = vec![0u8; sub.padded_len()];
            for facet in Facet::ALL {
                for p in sub.facet_ranges(facet).update.points() {
                    hits[sub.index(p)] += 1;
                }
            }
            for p in sub.interior().points() {
                hits[sub.index(p)] += 1;
            }
            let owned = Span3 { x: (1, nx), y: (1, ny), z: (1, nz) };
            for i in 0..nx + 2 {
                for j in 0..ny + 2 {
                    for k in 0..nz + 2 {
                        let expected = u8::from(owned.contains([i, j, k]));
                        prop_assert_eq!(hits[sub.index([i, j, k])], expected);
                    }
                }
            }
        }
    }
}
