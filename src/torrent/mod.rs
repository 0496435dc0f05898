//! BitTorrent protocol stack.
//!
//! Layering, bottom up: [`bencode`] (BEP 3 values), [`metainfo`] and
//! [`magnet`] (torrent identity), [`peer`] (wire protocol), [`tracker`]
//! (HTTP/UDP announce), [`dht`]/[`lpd`] (supplementary discovery),
//! [`disk`] (piece persistence), [`piece_picker`] (scheduling), and
//! [`session`] (per-download orchestration). The engine shares one
//! listener, one DHT node and one LPD socket across all sessions.

pub mod bencode;
pub mod dht;
pub mod disk;
pub mod listener;
pub mod lpd;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod piece_picker;
pub mod session;
pub mod tracker;

pub use magnet::MagnetLink;
pub use metainfo::Metainfo;
pub use session::{
    LivePeer, SessionQuery, SwarmServices, TorrentFileInfo, TorrentInput, TorrentParams,
};

/// Builds the engine's peer id: the client tag followed by random digits.
#[must_use]
pub fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;
    let mut id = *b"-FD0100-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id.iter_mut().skip(8) {
        *byte = b'0' + rng.gen_range(0..10u8);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-FD0100-");
        assert!(id[8..].iter().all(u8::is_ascii_digit));
        // Two ids rarely collide.
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
