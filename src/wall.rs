//! Grid of live camera tiles.
//!
//! A [`StreamWall`] mounts one [`StreamConnection`] per active device and keeps the set
//! in step with the backend's device list. Unmounting a tile closes its connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::client::DeviceInfo;
use crate::connection::{ConnectionConfig, ConnectionState, DisplaySurface, NullSurface, StreamConnection};
use crate::transport::FrameTransport;

/// Builds the display surface for a newly mounted tile.
pub type SurfaceFactory = Box<dyn Fn(&DeviceInfo) -> Box<dyn DisplaySurface> + Send>;

/// Tiles mounted and unmounted by one [`StreamWall::sync_devices`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WallChanges {
    /// Newly mounted device indices.
    pub mounted: Vec<u32>,
    /// Unmounted device indices.
    pub unmounted: Vec<u32>,
}

impl WallChanges {
    /// True if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty() && self.unmounted.is_empty()
    }
}

struct Tile {
    info: DeviceInfo,
    connection: StreamConnection,
}

/// One stream connection per mounted device, keyed by device index.
pub struct StreamWall {
    tiles: BTreeMap<u32, Tile>,
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    backoff: Arc<dyn BackoffPolicy>,
    surfaces: SurfaceFactory,
    runtime: Handle,
}

impl StreamWall {
    /// Empty wall.
    pub fn new(transport: Arc<dyn FrameTransport>, config: ConnectionConfig, runtime: Handle) -> Self {
        Self {
            tiles: BTreeMap::new(),
            transport,
            config,
            backoff: Arc::new(Backoff::default()),
            surfaces: Box::new(|_: &DeviceInfo| -> Box<dyn DisplaySurface> { Box::new(NullSurface) }),
            runtime,
        }
    }

    /// Backoff policy shared by all tiles.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Surface factory for new tiles.
    #[must_use]
    pub fn with_surfaces(
        mut self,
        factory: impl Fn(&DeviceInfo) -> Box<dyn DisplaySurface> + Send + 'static,
    ) -> Self {
        self.surfaces = Box::new(factory);
        self
    }

    /// Mount tiles for active devices that have none and unmount tiles whose device is
    /// gone or inactive.
    pub fn sync_devices(&mut self, devices: &[DeviceInfo]) -> WallChanges {
        let mut changes = WallChanges::default();

        let wanted: BTreeMap<u32, &DeviceInfo> = devices
            .iter()
            .filter(|d| d.active)
            .map(|d| (d.index, d))
            .collect();

        let stale: Vec<u32> = self
            .tiles
            .keys()
            .copied()
            .filter(|index| !wanted.contains_key(index))
            .collect();
        for index in stale {
            if let Some(mut tile) = self.tiles.remove(&index) {
                tile.connection.close();
                info!(device = index, "Unmounted tile");
                changes.unmounted.push(index);
            }
        }

        for (index, info) in wanted {
            if let Some(tile) = self.tiles.get_mut(&index) {
                tile.info = info.clone();
                continue;
            }
            let mut connection = StreamConnection::new(
                index,
                Arc::clone(&self.transport),
                self.config.clone(),
                self.runtime.clone(),
            )
            .with_shared_backoff(Arc::clone(&self.backoff))
            .with_surface((self.surfaces)(info));
            connection.open(index);
            info!(device = index, name = %info.name, "Mounted tile");
            self.tiles.insert(
                index,
                Tile {
                    info: info.clone(),
                    connection,
                },
            );
            changes.mounted.push(index);
        }

        if !changes.is_empty() {
            debug!(?changes, tiles = self.tiles.len(), "Device list synced");
        }
        changes
    }

    /// Pause one tile. Returns false if it is not mounted.
    pub fn pause(&mut self, index: u32) -> bool {
        match self.tiles.get_mut(&index) {
            Some(tile) => {
                tile.connection.pause();
                true
            }
            None => false,
        }
    }

    /// Resume one tile. Returns false if it is not mounted.
    pub fn resume(&mut self, index: u32) -> bool {
        match self.tiles.get_mut(&index) {
            Some(tile) => {
                tile.connection.resume();
                true
            }
            None => false,
        }
    }

    /// Pause every tile.
    pub fn pause_all(&mut self) {
        for tile in self.tiles.values_mut() {
            tile.connection.pause();
        }
    }

    /// Resume every tile.
    pub fn resume_all(&mut self) {
        for tile in self.tiles.values_mut() {
            tile.connection.resume();
        }
    }

    /// Apply queued completions on every tile. Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        self.tiles.values_mut().map(|t| t.connection.poll()).sum()
    }

    /// Snapshots of all tiles in device order.
    #[must_use]
    pub fn states(&self) -> Vec<(u32, ConnectionState)> {
        self.tiles
            .iter()
            .map(|(index, tile)| (*index, tile.connection.state()))
            .collect()
    }

    /// Connection of one tile.
    #[must_use]
    pub fn connection(&self, index: u32) -> Option<&StreamConnection> {
        self.tiles.get(&index).map(|t| &t.connection)
    }

    /// Device info of one tile.
    #[must_use]
    pub fn device(&self, index: u32) -> Option<&DeviceInfo> {
        self.tiles.get(&index).map(|t| &t.info)
    }

    /// Mounted device indices in order.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        self.tiles.keys().copied().collect()
    }

    /// Number of mounted tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// True if no tile is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Unmount everything.
    pub fn clear(&mut self) {
        for (_, mut tile) in std::mem::take(&mut self.tiles) {
            tile.connection.close();
        }
    }
}

impl Drop for StreamWall {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Phase;
    use crate::transport::mock::MockTransport;

    fn device(index: u32, active: bool) -> DeviceInfo {
        DeviceInfo {
            index,
            name: format!("Camera {index}"),
            active,
        }
    }

    fn wall(transport: &MockTransport) -> StreamWall {
        StreamWall::new(
            Arc::new(transport.clone()),
            ConnectionConfig::default(),
            Handle::current(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sync_mounts_active_devices_only() {
        let transport = MockTransport::new();
        let mut wall = wall(&transport);

        let changes = wall.sync_devices(&[device(0, true), device(1, false), device(2, true)]);
        assert_eq!(changes.mounted, vec![0, 2]);
        assert!(changes.unmounted.is_empty());
        assert_eq!(wall.indices(), vec![0, 2]);
        assert_eq!(
            wall.connection(0).map(StreamConnection::phase),
            Some(Phase::Connecting)
        );

        // Same list again is a no-op
        assert!(wall.sync_devices(&[device(0, true), device(2, true)]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_unmounts_vanished_and_inactive() {
        let transport = MockTransport::new();
        let mut wall = wall(&transport);
        wall.sync_devices(&[device(0, true), device(1, true), device(2, true)]);

        let changes = wall.sync_devices(&[device(0, true), device(1, false)]);
        assert_eq!(changes.unmounted, vec![1, 2]);
        assert_eq!(wall.indices(), vec![0]);
        assert_eq!(wall.device(0).map(|d| d.name.as_str()), Some("Camera 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_tiles() {
        let transport = MockTransport::new();
        let mut wall = wall(&transport);
        wall.sync_devices(&[device(0, true), device(1, true)]);

        assert!(wall.pause(0));
        assert!(!wall.pause(9));
        let states = wall.states();
        assert_eq!(states[0].1.phase, Phase::Idle);
        assert!(states[0].1.paused);
        assert_eq!(states[1].1.phase, Phase::Connecting);

        wall.pause_all();
        assert!(wall.states().iter().all(|(_, s)| s.paused));

        wall.resume_all();
        assert!(wall
            .states()
            .iter()
            .all(|(_, s)| !s.paused && s.phase == Phase::Connecting));
        assert!(wall.resume(1));
    }
}
