//! planetfile reads OpenStreetMap planet dumps in the OSM-PBF format,
//! from a local file or straight off a download that's still in flight.
//!
//! Reading an already-downloaded file:
//!
//! ```no_run
//! # use std::fs::File;
//! # use planetfile::*;
//! let file = File::open("planet-250106.osm.pbf")?;
//! let mut reader = BlockReader::new(file);
//! while let Some((_, block)) = reader.read_block()? {
//!     for i in 0..block.num_nodes() {
//!         let node = block.node_at(i)?;
//!         println!("{} @ {:.7},{:.7}", node.id(), node.lat(), node.lon());
//!     }
//! }
//! # Ok::<(), planetfile::PlanetError>(())
//! ```
//!
//! To parse while downloading, point the [`BlockReader`] at the download's
//! tailing reader. Blocks decode as soon as their bytes land on disk; the
//! reader blocks whenever it catches up with the download:
//!
//! ```no_run
//! # use planetfile::*;
//! let names = latest()?;
//! let hosts = mirrors(&names[0])?;
//! let dl = download(&format!("{}{}", hosts[0], names[0]), "planet.osm.pbf");
//! let mut reader = BlockReader::new(dl.reader());
//! while let Some((_, block)) = reader.read_block()? {
//!     println!("{} with {} strings", block.data_kind(), block.num_strings());
//! }
//! # Ok::<(), planetfile::PlanetError>(())
//! ```
//!
//! Downloads are resumable: pointing [`download`] at a partially-written
//! file continues from its current length with an HTTP range request.

pub mod block;
pub mod download;
pub mod mirrors;
pub mod read;
pub mod result;

pub use block::{Block, DataKind, Node, Relation, Way, What};
pub use download::{download, download_from, DownloadReader, DownloadStatus, Downloader};
pub use mirrors::{
    latest, latest_from, mirrors, mirrors_from, valid_base_name, ALL_MIRRORS, PRIMARY_URL,
};
pub use read::BlockReader;
pub use result::{PlanetError, PlanetResult};

mod wire;

#[cfg(test)]
mod testenc;
