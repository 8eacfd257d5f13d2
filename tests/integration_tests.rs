//! Integration tests for the dedicated server
//!
//! These tests run a real server on a loopback socket and talk to it the way a
//! game client does.

use server::config::{LiveConfig, ServerConfig};
use server::game::{GameController, World, OBJ_CHARACTER, OBJ_PLAYER_INFO};
use server::network::Server;
use server::transport::ServerMessage;
use shared::packet::{connless_packet, parse_packet, RawPacket, SERVERBROWSE_GETINFO, SERVERBROWSE_INFO};
use shared::protocol::*;
use shared::snapshot::item_key;
use shared::{varint, ControlMsg, Datagram, MsgId, Packer, Snapshot, SnapshotDelta, SnapMsg, Unpacker};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config(maps_dir: &Path, max_clients: usize) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_clients,
        tick_speed: SERVER_TICK_SPEED,
        high_bandwidth: false,
        name: "integration".to_string(),
        map: "arena".to_string(),
        maps_dir: maps_dir.to_path_buf(),
        password: String::new(),
        sqlite_file: None,
        use_sql: false,
        timeout: Duration::from_secs(30),
        sql_prefix: "record".to_string(),
        sql_server: "INT".to_string(),
        exec: Vec::new(),
    }
}

/// Starts a server in the background and returns its address
async fn start_server(
    maps_dir: &Path,
    max_clients: usize,
) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>, JoinHandle<()>) {
    let mut server = Server::new(
        test_config(maps_dir, max_clients),
        LiveConfig::default(),
        Box::new(World::new()),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let control = server.message_sender();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, control, handle)
}

fn write_map(dir: &Path, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join("arena.map"), &data).unwrap();
    data
}

struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
    sequence: u16,
}

impl TestClient {
    async fn new(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            sequence: 0,
        }
    }

    async fn send(&self, datagram: Datagram) {
        self.socket
            .send_to(&datagram.encode().unwrap(), self.server)
            .await
            .unwrap();
    }

    async fn send_msg(&mut self, packer: Packer, vital: bool) {
        let sequence = if vital {
            self.sequence = self.sequence.wrapping_add(1);
            self.sequence
        } else {
            0
        };
        self.send(Datagram::Chunk {
            vital,
            sequence,
            payload: packer.into_bytes(),
        })
        .await;
    }

    async fn recv_datagram(&self) -> Datagram {
        let mut buffer = [0u8; 2048];
        let (len, _) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        match parse_packet(&buffer[..len]).unwrap() {
            RawPacket::Routed(datagram) => datagram,
            RawPacket::Connless(_) => panic!("Unexpected connless packet"),
        }
    }

    /// Skips everything until a system message with `wanted` id arrives and
    /// returns its body after the header
    async fn recv_msg(&self, wanted: i32) -> Vec<u8> {
        loop {
            if let Datagram::Chunk { payload, .. } = self.recv_datagram().await {
                let mut unpacker = Unpacker::new(&payload);
                if let Ok((MsgId::Id(id), true)) = unpack_msg_header(&mut unpacker) {
                    if id == wanted {
                        return unpacker.remaining().to_vec();
                    }
                }
            }
        }
    }

    async fn recv_snap(&self) -> SnapMsg {
        loop {
            if let Datagram::Chunk { payload, .. } = self.recv_datagram().await {
                let mut unpacker = Unpacker::new(&payload);
                if let Ok((MsgId::Id(id), true)) = unpack_msg_header(&mut unpacker) {
                    if matches!(id, NETMSG_SNAP | NETMSG_SNAPEMPTY | NETMSG_SNAPSINGLE) {
                        return SnapMsg::decode(id, &mut unpacker).unwrap();
                    }
                }
            }
        }
    }

    async fn connect(&mut self) {
        self.send(Datagram::Control(ControlMsg::Connect { sixup: false })).await;
        assert_eq!(self.recv_datagram().await, Datagram::Control(ControlMsg::Accept));
    }

    /// Handshake up to the point where the client downloaded the map
    async fn load_map(&mut self) -> Vec<u8> {
        let mut info = msg_packer(NETMSG_INFO, true);
        info.add_string(NET_VERSION).add_string("").add_string("integration tee");
        self.send_msg(info, true).await;

        let body = self.recv_msg(NETMSG_MAP_CHANGE).await;
        let mut unpacker = Unpacker::new(&body);
        assert_eq!(unpacker.get_string().unwrap(), "arena");
        let crc = unpacker.get_int().unwrap();
        let size = unpacker.get_int().unwrap() as usize;
        let sha256 = unpacker.get_raw(32).unwrap();
        assert_eq!(crc as u32, u32::from_be_bytes([sha256[0], sha256[1], sha256[2], sha256[3]]));

        let mut data = Vec::new();
        for chunk in 0.. {
            let mut request = msg_packer(NETMSG_REQUEST_MAP_DATA, true);
            request.add_int(chunk);
            self.send_msg(request, true).await;

            let body = self.recv_msg(NETMSG_MAP_DATA).await;
            let mut unpacker = Unpacker::new(&body);
            let last = unpacker.get_int().unwrap();
            assert_eq!(unpacker.get_int().unwrap(), crc);
            assert_eq!(unpacker.get_int().unwrap(), chunk);
            let len = unpacker.get_int().unwrap() as usize;
            data.extend_from_slice(unpacker.get_raw(len).unwrap());
            if last != 0 {
                break;
            }
        }
        assert_eq!(data.len(), size);
        data
    }

    async fn enter_game(&mut self) {
        self.send_msg(msg_packer(NETMSG_READY, true), true).await;
        self.recv_msg(NETMSG_CON_READY).await;
        self.send_msg(msg_packer(NETMSG_ENTERGAME, true), true).await;
    }
}

fn world_delta() -> SnapshotDelta {
    let mut delta = SnapshotDelta::new();
    for (type_id, size) in World::new().item_sizes() {
        delta.set_static_size(type_id, size);
    }
    delta
}

fn assemble(msg: SnapMsg) -> AssembledSnap {
    SnapshotReassembler::new()
        .push(msg)
        .expect("snapshot spans several packets")
}

fn apply_snap(base: &Snapshot, assembled: &AssembledSnap, delta: &SnapshotDelta) -> Snapshot {
    if assembled.data.is_empty() {
        return base.clone();
    }
    let ints = varint::decompress(&assembled.data).unwrap();
    let snap = delta.unpack_delta(base, &ints).unwrap();
    assert_eq!(snap.crc(), assembled.crc);
    snap
}

/// CONNECTION TESTS
mod connection_tests {
    use super::*;

    /// Walks a client through map download into the game and decodes the
    /// snapshots it receives
    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let map = write_map(dir.path(), MAP_CHUNK_SIZE * 2 + 300);
        let (addr, control, handle) = start_server(dir.path(), 4).await;

        let mut client = TestClient::new(addr).await;
        client.connect().await;
        assert_eq!(client.load_map().await, map);
        client.enter_game().await;

        let delta = world_delta();
        let first = assemble(client.recv_snap().await);
        assert_eq!(first.delta_tick, -1);
        let tick = first.tick;
        let snap = apply_snap(&Snapshot::empty(), &first, &delta);
        let player = snap.find(item_key(OBJ_PLAYER_INFO, 0)).unwrap();
        assert_eq!(player.data[0], 1, "own player is flagged local");
        assert!(snap.find(item_key(OBJ_CHARACTER, 0)).is_some());

        // acknowledge it and run right for a while
        let mut input = msg_packer(NETMSG_INPUT, true);
        input.add_int(tick).add_int(tick + 2).add_int(16);
        for value in [1, 0, 0, 0] {
            input.add_int(value);
        }
        client.send_msg(input, false).await;

        let timing = client.recv_msg(NETMSG_INPUTTIMING).await;
        assert_eq!(Unpacker::new(&timing).get_int().unwrap(), tick + 2);

        loop {
            let msg = assemble(client.recv_snap().await);
            if msg.tick <= tick || msg.delta_tick != tick {
                // sent before the ack arrived
                continue;
            }
            let next = apply_snap(&snap, &msg, &delta);
            let before = snap.find(item_key(OBJ_CHARACTER, 0)).unwrap().data[1];
            let after = next.find(item_key(OBJ_CHARACTER, 0)).unwrap().data[1];
            assert!(after >= before);
            break;
        }

        control.send(ServerMessage::Shutdown).unwrap();
        loop {
            if let Datagram::Control(ControlMsg::Close { reason }) = client.recv_datagram().await {
                assert_eq!(reason, "Server shutdown");
                break;
            }
        }
        timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
    }

    /// A full server turns new clients away with a reason
    #[tokio::test(flavor = "multi_thread")]
    async fn full_server_rejects_client() {
        let dir = tempfile::tempdir().unwrap();
        write_map(dir.path(), 100);
        let (addr, control, handle) = start_server(dir.path(), 1).await;

        let mut first = TestClient::new(addr).await;
        first.connect().await;

        let second = TestClient::new(addr).await;
        second
            .send(Datagram::Control(ControlMsg::Connect { sixup: false }))
            .await;
        assert_eq!(
            second.recv_datagram().await,
            Datagram::Control(ControlMsg::Close {
                reason: "This server is full".to_string()
            })
        );

        control.send(ServerMessage::Shutdown).unwrap();
        timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
    }

    /// A client that leaves frees its slot for the next one
    #[tokio::test(flavor = "multi_thread")]
    async fn close_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        write_map(dir.path(), 100);
        let (addr, control, handle) = start_server(dir.path(), 1).await;

        let mut first = TestClient::new(addr).await;
        first.connect().await;
        first
            .send(Datagram::Control(ControlMsg::Close {
                reason: String::new(),
            }))
            .await;

        let mut second = TestClient::new(addr).await;
        second.connect().await;

        control.send(ServerMessage::Shutdown).unwrap();
        timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
    }
}

/// SERVER BROWSER TESTS
mod browser_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn info_query() {
        let dir = tempfile::tempdir().unwrap();
        write_map(dir.path(), 100);
        let (addr, control, handle) = start_server(dir.path(), 8).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut request = Packer::new();
        request.add_int(1234);
        socket
            .send_to(&connless_packet(&SERVERBROWSE_GETINFO, request.data()), addr)
            .await
            .unwrap();

        let mut buffer = [0u8; 2048];
        let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let body = match parse_packet(&buffer[..len]).unwrap() {
            RawPacket::Connless(body) => body,
            other => panic!("Unexpected packet: {:?}", other),
        };
        let info = body.strip_prefix(&SERVERBROWSE_INFO[..]).unwrap();
        let mut unpacker = Unpacker::new(info);
        assert_eq!(unpacker.get_string().unwrap(), "1234");
        assert_eq!(unpacker.get_string().unwrap(), GAME_VERSION);
        assert_eq!(unpacker.get_string().unwrap(), "integration");
        assert_eq!(unpacker.get_string().unwrap(), "arena");
        assert_eq!(unpacker.get_string().unwrap(), "DDraceNetwork");
        assert_eq!(unpacker.get_int().unwrap(), 0);
        assert_eq!(unpacker.get_int().unwrap(), 0);
        assert_eq!(unpacker.get_int().unwrap(), 8);

        control.send(ServerMessage::Shutdown).unwrap();
        timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
    }

    /// Startup fails cleanly when the map is missing
    #[test]
    fn missing_map_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let result = tokio_test::block_on(Server::new(
            test_config(dir.path(), 4),
            LiveConfig::default(),
            Box::new(World::new()),
        ));
        match result {
            Err(server::ServerError::MapLoad { path, .. }) => assert!(path.ends_with("arena.map")),
            Err(other) => panic!("Unexpected error: {}", other),
            Ok(_) => panic!("server started without a map"),
        }
    }
}
