//! The five heat3d kernels.
//!
//! Sub-domains and halo buffers hold `f32` values; sub-domain points are
//! addressed through [`SubDomain::index`].

use super::topology::{Facet, Span3, SubDomain};
use crate::backend::{ComputeBackend, HostBackend, HostBuffer};
use crate::error::{Error, Result};
use std::f32::consts::PI;

pub const VALUE_SIZE: usize = std::mem::size_of::<f32>();

/// Kernels a backend must provide to run heat3d.
pub trait StencilKernels: ComputeBackend {
    /// Fills the owned points of `domain` with the initial temperature field
    /// of the rank at `coords` and zeroes the ghost layer.
    fn init_temperature(
        &self,
        domain: &Self::Buffer,
        sub: &SubDomain,
        coords: [u32; 3],
        delta_space: f32,
    ) -> Result<()>;

    /// Copies the boundary layer of `facet` into `send`.
    fn pack_send_buffer(
        &self,
        domain: &Self::Buffer,
        send: &Self::Buffer,
        sub: &SubDomain,
        facet: Facet,
    ) -> Result<()>;

    /// Copies `recv` into the ghost layer of `facet`.
    fn unpack_recv_buffer(
        &self,
        recv: &Self::Buffer,
        domain: &Self::Buffer,
        sub: &SubDomain,
        facet: Facet,
    ) -> Result<()>;

    /// One explicit step over the boundary points owned by `facet`.
    fn update_facet(
        &self,
        old: &Self::Buffer,
        new: &Self::Buffer,
        sub: &SubDomain,
        facet: Facet,
        weight: f32,
    ) -> Result<()>;

    /// One explicit step over the points that touch no ghost value.
    fn update_interior(
        &self,
        old: &Self::Buffer,
        new: &Self::Buffer,
        sub: &SubDomain,
        weight: f32,
    ) -> Result<()>;
}

/// Initial temperature at a global grid position.
pub fn initial_temperature(global: [u32; 3], delta_space: f32) -> f32 {
    global
        .iter()
        .map(|&g| (PI * (g as f32 + 0.5) * delta_space).sin())
        .product()
}

/// Values of a box of sub-domain points, in [`Span3::points`] order.
struct Window {
    span: Span3,
    values: Vec<f32>,
}

impl Window {
    fn at(&self, [i, j, k]: [u32; 3]) -> f32 {
        let ny = (self.span.y.1 - self.span.y.0 + 1) as usize;
        let nz = (self.span.z.1 - self.span.z.0 + 1) as usize;
        let di = (i - self.span.x.0) as usize;
        let dj = (j - self.span.y.0) as usize;
        let dk = (k - self.span.z.0) as usize;
        self.values[(di * ny + dj) * nz + dk]
    }
}

fn step(old: &Window, [i, j, k]: [u32; 3], weight: f32) -> f32 {
    let centre = old.at([i, j, k]);
    let neighbors = old.at([i + 1, j, k])
        + old.at([i - 1, j, k])
        + old.at([i, j + 1, k])
        + old.at([i, j - 1, k])
        + old.at([i, j, k + 1])
        + old.at([i, j, k - 1]);
    centre + weight * (neighbors - 6.0 * centre)
}

fn decode(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(VALUE_SIZE)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
}

impl HostBackend {
    fn load_values(&self, buffer: &HostBuffer, expected: usize) -> Result<Vec<f32>> {
        let len = self.buffer_len(buffer);
        if len < expected * VALUE_SIZE {
            return Err(Error::backend(format!(
                "buffer of {len} bytes cannot hold {expected} values"
            )));
        }
        let mut bytes = vec![0u8; expected * VALUE_SIZE];
        self.read(buffer, 0, &mut bytes)?;
        Ok(decode(&bytes).collect())
    }

    fn store_values(&self, buffer: &HostBuffer, values: &[f32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        self.write(buffer, 0, &bytes)
    }

    fn check_domain(&self, buffer: &HostBuffer, sub: &SubDomain) -> Result<()> {
        let len = self.buffer_len(buffer);
        if len < sub.padded_len() * VALUE_SIZE {
            return Err(Error::backend(format!(
                "buffer of {len} bytes cannot hold a {}x{}x{} sub-domain",
                sub.nx, sub.ny, sub.nz
            )));
        }
        Ok(())
    }

    /// Reads the points of `span` one z-run at a time.
    fn load_span(&self, buffer: &HostBuffer, sub: &SubDomain, span: Span3) -> Result<Vec<f32>> {
        self.check_domain(buffer, sub)?;
        let mut values = Vec::with_capacity(span.len());
        if span.is_empty() {
            return Ok(values);
        }
        let mut row = vec![0u8; (span.z.1 - span.z.0 + 1) as usize * VALUE_SIZE];
        for i in span.x.0..=span.x.1 {
            for j in span.y.0..=span.y.1 {
                self.read(buffer, sub.index([i, j, span.z.0]) * VALUE_SIZE, &mut row)?;
                values.extend(decode(&row));
            }
        }
        Ok(values)
    }

    /// Writes `values` to the points of `span`, leaving every other point
    /// as it was.
    fn store_span(
        &self,
        buffer: &HostBuffer,
        sub: &SubDomain,
        span: Span3,
        values: &[f32],
    ) -> Result<()> {
        self.check_domain(buffer, sub)?;
        if values.len() != span.len() {
            return Err(Error::backend(format!(
                "{} values for a span of {} points",
                values.len(),
                span.len()
            )));
        }
        if span.is_empty() {
            return Ok(());
        }
        let run = (span.z.1 - span.z.0 + 1) as usize;
        let rows = (span.x.0..=span.x.1).flat_map(|i| (span.y.0..=span.y.1).map(move |j| (i, j)));
        for ((i, j), chunk) in rows.zip(values.chunks_exact(run)) {
            let bytes: Vec<u8> = chunk.iter().flat_map(|v| v.to_ne_bytes()).collect();
            self.write(buffer, sub.index([i, j, span.z.0]) * VALUE_SIZE, &bytes)?;
        }
        Ok(())
    }

    fn update_span(
        &self,
        old: &HostBuffer,
        new: &HostBuffer,
        sub: &SubDomain,
        span: Span3,
        weight: f32,
    ) -> Result<()> {
        if span.is_empty() {
            return Ok(());
        }
        // Owned points only, so the one-point border stays inside the ghost layer.
        let border = Span3 {
            x: (span.x.0 - 1, span.x.1 + 1),
            y: (span.y.0 - 1, span.y.1 + 1),
            z: (span.z.0 - 1, span.z.1 + 1),
        };
        let before = Window {
            span: border,
            values: self.load_span(old, sub, border)?,
        };
        let after: Vec<f32> = span.points().map(|p| step(&before, p, weight)).collect();
        self.store_span(new, sub, span, &after)
    }
}

impl StencilKernels for HostBackend {
    fn init_temperature(
        &self,
        domain: &HostBuffer,
        sub: &SubDomain,
        coords: [u32; 3],
        delta_space: f32,
    ) -> Result<()> {
        let mut values = vec![0.0f32; sub.padded_len()];
        let owned = Span3 {
            x: (1, sub.nx),
            y: (1, sub.ny),
            z: (1, sub.nz),
        };
        let extent = [sub.nx, sub.ny, sub.nz];
        for p in owned.points() {
            let global = [0, 1, 2].map(|a| coords[a] * extent[a] + p[a] - 1);
            values[sub.index(p)] = initial_temperature(global, delta_space);
        }
        self.store_values(domain, &values)
    }

    fn pack_send_buffer(
        &self,
        domain: &HostBuffer,
        send: &HostBuffer,
        sub: &SubDomain,
        facet: Facet,
    ) -> Result<()> {
        let halo = self.load_span(domain, sub, sub.facet_ranges(facet).inner)?;
        self.store_values(send, &halo)
    }

    fn unpack_recv_buffer(
        &self,
        recv: &HostBuffer,
        domain: &HostBuffer,
        sub: &SubDomain,
        facet: Facet,
    ) -> Result<()> {
        let outer = sub.facet_ranges(facet).outer;
        let halo = self.load_values(recv, outer.len())?;
        self.store_span(domain, sub, outer, &halo)
    }

    fn update_facet(
        &self,
        old: &HostBuffer,
        new: &HostBuffer,
        sub: &SubDomain,
        facet: Facet,
        weight: f32,
    ) -> Result<()> {
        self.update_span(old, new, sub, sub.facet_ranges(facet).update, weight)
    }

    fn update_interior(
        &self,
        old: &HostBuffer,
        new: &HostBuffer,
        sub: &SubDomain,
        weight: f32,
    ) -> Result<()> {
        self.update_span(old, new, sub, sub.interior(), weight)
    }
}
