use std::sync::LazyLock;

use glam::Vec3;
use log::warn;

use super::NetError;

/// Number of unit vectors in the quantized direction table.
pub const NUM_DIRECTIONS: usize = 162;

const COORD_SCALE: f32 = 8.0;
const ANGLE_SCALE: f32 = 256.0 / 360.0;
const ANGLE16_SCALE: f32 = 65536.0 / 360.0;

/// Icosphere vertices (an icosahedron subdivided twice), sorted so index
/// assignment is reproducible. Directions on the wire are indices into this.
static DIRECTIONS: LazyLock<Vec<Vec3>> = LazyLock::new(build_directions);

fn build_directions() -> Vec<Vec3> {
    use std::collections::HashMap;

    let t = (1.0 + 5.0f32.sqrt()) / 2.0;
    let mut verts: Vec<Vec3> = [
        (-1.0, t, 0.0),
        (1.0, t, 0.0),
        (-1.0, -t, 0.0),
        (1.0, -t, 0.0),
        (0.0, -1.0, t),
        (0.0, 1.0, t),
        (0.0, -1.0, -t),
        (0.0, 1.0, -t),
        (t, 0.0, -1.0),
        (t, 0.0, 1.0),
        (-t, 0.0, -1.0),
        (-t, 0.0, 1.0),
    ]
    .iter()
    .map(|&(x, y, z)| Vec3::new(x, y, z).normalize())
    .collect();

    let mut faces: Vec<[usize; 3]> = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    for _ in 0..2 {
        let mut cache: HashMap<(usize, usize), usize> = HashMap::new();
        let mut midpoint = |a: usize, b: usize, verts: &mut Vec<Vec3>| -> usize {
            let key = (a.min(b), a.max(b));
            if let Some(&i) = cache.get(&key) {
                return i;
            }
            let m = ((verts[a] + verts[b]) * 0.5).normalize();
            verts.push(m);
            cache.insert(key, verts.len() - 1);
            verts.len() - 1
        };

        let mut next = Vec::with_capacity(faces.len() * 4);
        for [a, b, c] in faces {
            let ab = midpoint(a, b, &mut verts);
            let bc = midpoint(b, c, &mut verts);
            let ca = midpoint(c, a, &mut verts);
            next.push([a, ab, ca]);
            next.push([b, bc, ab]);
            next.push([c, ca, bc]);
            next.push([ab, bc, ca]);
        }
        faces = next;
    }

    debug_assert_eq!(verts.len(), NUM_DIRECTIONS);

    verts.sort_by(|a, b| {
        a.x.total_cmp(&b.x)
            .then(a.y.total_cmp(&b.y))
            .then(a.z.total_cmp(&b.z))
    });
    verts
}

/// Bounded wire message with a write end and a read cursor. All multi-byte
/// values are little-endian. Quantized primitives (coords, angles,
/// directions) live here so both codec halves agree on precision.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    data: Vec<u8>,
    capacity: usize,
    read: usize,
    /// When set, an overflowing write clears the buffer and records the
    /// condition instead of failing; owners poll `overflowed`.
    pub allow_overflow: bool,
    pub overflowed: bool,
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            read: 0,
            allow_overflow: false,
            overflowed: false,
        }
    }

    /// Parse buffer over a received payload.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            capacity: data.len(),
            read: 0,
            allow_overflow: false,
            overflowed: false,
        }
    }

    /// Reload this buffer with a received payload, reusing the allocation.
    pub fn load(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.capacity = self.capacity.max(data.len());
        self.read = 0;
        self.overflowed = false;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read = 0;
        self.overflowed = false;
    }

    pub fn begin_reading(&mut self) {
        self.read = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread bytes remaining behind the read cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn check_space(&mut self, len: usize) -> Result<(), NetError> {
        if self.data.len() + len <= self.capacity {
            return Ok(());
        }
        if !self.allow_overflow || len > self.capacity {
            return Err(NetError::Overflow);
        }
        warn!(
            "message buffer overflowed ({} + {} > {}), clearing",
            self.data.len(),
            len,
            self.capacity
        );
        self.overflowed = true;
        self.data.clear();
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), NetError> {
        self.check_space(1)?;
        self.data.push(v);
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<(), NetError> {
        self.check_space(2)?;
        self.data.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), NetError> {
        self.check_space(2)?;
        self.data.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), NetError> {
        self.check_space(4)?;
        self.data.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), NetError> {
        self.check_space(4)?;
        self.data.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), NetError> {
        self.check_space(4)?;
        self.data.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        self.check_space(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// NUL-terminated string. Embedded NUL is refused rather than silently
    /// truncating the tail.
    pub fn write_string(&mut self, s: &str) -> Result<(), NetError> {
        if s.as_bytes().contains(&0) {
            return Err(NetError::Malformed("string contains NUL"));
        }
        self.check_space(s.len() + 1)?;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// World coordinate quantized to 1/8 unit.
    pub fn write_coord(&mut self, v: f32) -> Result<(), NetError> {
        self.write_i16((v * COORD_SCALE).round() as i16)
    }

    pub fn write_pos(&mut self, pos: Vec3) -> Result<(), NetError> {
        self.write_coord(pos.x)?;
        self.write_coord(pos.y)?;
        self.write_coord(pos.z)
    }

    /// Angle in degrees quantized to 256 steps per rotation.
    pub fn write_angle(&mut self, v: f32) -> Result<(), NetError> {
        self.write_u8(((v * ANGLE_SCALE).round() as i32 & 255) as u8)
    }

    /// Angle in degrees quantized to 65536 steps per rotation.
    pub fn write_angle16(&mut self, v: f32) -> Result<(), NetError> {
        self.write_u16(((v * ANGLE16_SCALE).round() as i32 & 65535) as u16)
    }

    /// Unit vector snapped to the nearest table direction. Ties go to the
    /// lowest index; a zero vector encodes as index 0.
    pub fn write_dir(&mut self, dir: Vec3) -> Result<(), NetError> {
        let mut best = 0usize;
        if dir.length_squared() > 0.0 {
            let n = dir.normalize();
            let mut best_dot = f32::MIN;
            for (i, candidate) in DIRECTIONS.iter().enumerate() {
                let dot = n.dot(*candidate);
                if dot > best_dot {
                    best_dot = dot;
                    best = i;
                }
            }
        }
        self.write_u8(best as u8)
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8], NetError> {
        if self.read + len > self.data.len() {
            return Err(NetError::Truncated);
        }
        let s = &self.data[self.read..self.read + len];
        self.read += len;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, NetError> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16, NetError> {
        let b = self.read_slice(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> Result<u16, NetError> {
        let b = self.read_slice(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, NetError> {
        let b = self.read_slice(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, NetError> {
        let b = self.read_slice(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32, NetError> {
        let b = self.read_slice(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], NetError> {
        self.read_slice(len)
    }

    pub fn read_string(&mut self) -> Result<String, NetError> {
        let start = self.read;
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(NetError::Truncated)?;
        let s = String::from_utf8_lossy(&self.data[start..start + nul]).into_owned();
        self.read = start + nul + 1;
        Ok(s)
    }

    pub fn read_coord(&mut self) -> Result<f32, NetError> {
        Ok(self.read_i16()? as f32 / COORD_SCALE)
    }

    pub fn read_pos(&mut self) -> Result<Vec3, NetError> {
        Ok(Vec3::new(
            self.read_coord()?,
            self.read_coord()?,
            self.read_coord()?,
        ))
    }

    pub fn read_angle(&mut self) -> Result<f32, NetError> {
        Ok(self.read_u8()? as f32 / ANGLE_SCALE)
    }

    pub fn read_angle16(&mut self) -> Result<f32, NetError> {
        Ok(self.read_u16()? as f32 / ANGLE16_SCALE)
    }

    pub fn read_dir(&mut self) -> Result<Vec3, NetError> {
        let index = self.read_u8()? as usize;
        DIRECTIONS
            .get(index)
            .copied()
            .ok_or(NetError::Malformed("direction index out of range"))
    }
}
