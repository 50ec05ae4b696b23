use crate::protocol::{split_request, TxSelector, MAX_READ_LEN, TX_SPEC_LEN};
use crate::{
    BlockStorageService, EchoService, StorageError, StorageService, TxMode, TxRequest, TxResponse,
};
use kdb_common::{BlockDescriptor, DescriptorTag, PAYLOAD_LEN};
use kdb_net::{recv_frame, send_frame, ConnectionHandle, TcpTransport, TransportProvider};
use kdb_store::{block_offset, header, BlockStore};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

fn fresh_store() -> (NamedTempFile, BlockStore) {
    let file = NamedTempFile::new().unwrap();
    let mut store = BlockStore::open(file.path()).unwrap();
    let header = header::initialize(file.path(), 1);
    store
        .write_block(0, &header::encode(&header).unwrap())
        .unwrap();
    (file, store)
}

fn run(
    service: &dyn StorageService,
    store: &mut BlockStore,
    mode: TxMode,
    request: TxRequest,
) -> Result<Vec<u8>, StorageError> {
    let body = request.encode(mode).unwrap();
    let (mode, payload) = split_request(&body).unwrap();
    let tx = service.generate_tx(payload, mode)?;
    service.execute_tx(store, &tx)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_generate_tx_fills_descriptor() {
    let service = BlockStorageService::new();
    let request = TxRequest::write("user_123", "users.tbl", 42, b"hello".to_vec());
    let body = request.encode(TxMode::Write).unwrap();
    assert_eq!(body[0], b'W');

    let (mode, payload) = split_request(&body).unwrap();
    let tx = service.generate_tx(payload, mode).unwrap();
    assert_eq!(tx.size, 5);
    assert_eq!(tx.data, b"hello".to_vec());
    assert_eq!(tx.spec.len(), TX_SPEC_LEN);

    let selector = tx.selector().unwrap();
    assert_eq!(
        selector,
        TxSelector {
            mode: TxMode::Write,
            file_id: "user_123".into(),
            offset: 42,
            length: 0,
            file_name: "users.tbl".into(),
        }
    );

    // Ids are unique per service
    let next = service.generate_tx(payload, mode).unwrap();
    assert_ne!(next.id, tx.id);
}

#[test]
fn test_selector_layout() {
    let selector = TxSelector {
        mode: TxMode::Read,
        file_id: "abc".into(),
        offset: 0x0102,
        length: 7,
        file_name: "n".into(),
    };
    let spec = selector.encode().unwrap();
    assert_eq!(spec[0], b'R');
    assert_eq!(&spec[1..4], b"abc");
    assert_eq!(&spec[31..39], &0x0102u64.to_le_bytes());
    assert_eq!(&spec[39..47], &7u64.to_le_bytes());
    assert_eq!(spec[47], 1);
    assert_eq!(spec[48], b'n');
    assert_eq!(TxSelector::decode(&spec).unwrap(), selector);
}

#[test]
fn test_read_tx_carries_no_data() {
    let service = BlockStorageService::new();
    let mut request = TxRequest::read("f", 10, 300);
    request.data = b"ignored".to_vec();
    let body = request.encode(TxMode::Read).unwrap();
    let (mode, payload) = split_request(&body).unwrap();

    let tx = service.generate_tx(payload, mode).unwrap();
    assert_eq!(tx.size, 300);
    assert!(tx.data.is_empty());
}

#[test]
fn test_malformed_requests_are_rejected() {
    let service = BlockStorageService::new();

    assert!(matches!(
        split_request(&[]),
        Err(StorageError::Malformed(_))
    ));
    assert!(matches!(
        split_request(b"Xpayload"),
        Err(StorageError::InvalidMode(b'X'))
    ));
    assert!(matches!(
        service.generate_tx(&[0xFF, 0xFF, 0xFF], TxMode::Write),
        Err(StorageError::Malformed(_))
    ));

    let cases = vec![
        (TxMode::Write, TxRequest::write("", "n", 0, b"x".to_vec())),
        (TxMode::Write, TxRequest::write("x".repeat(31), "n", 0, b"x".to_vec())),
        (TxMode::Write, TxRequest::write("id", "n".repeat(81), 0, b"x".to_vec())),
        (TxMode::Write, TxRequest::write("a\0b", "n", 0, b"x".to_vec())),
        (TxMode::Write, TxRequest::write("id", "n", u64::MAX, b"x".to_vec())),
        (TxMode::Read, TxRequest::read("id", 0, MAX_READ_LEN + 1)),
    ];
    for (mode, request) in cases {
        let body = request.encode(mode).unwrap();
        let (mode, payload) = split_request(&body).unwrap();
        assert!(
            matches!(service.generate_tx(payload, mode), Err(StorageError::Malformed(_))),
            "{:?} should be rejected",
            request
        );
    }
}

#[test]
fn test_write_then_read() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    run(&service, &mut store, TxMode::Write, TxRequest::write("doc", "doc.bin", 0, b"hello world".to_vec())).unwrap();

    let data = run(&service, &mut store, TxMode::Read, TxRequest::read("doc", 0, 11)).unwrap();
    assert_eq!(data, b"hello world".to_vec());

    let data = run(&service, &mut store, TxMode::Read, TxRequest::read("doc", 6, 100)).unwrap();
    assert_eq!(data, b"world".to_vec());

    // header + descriptor + one page
    assert_eq!(store.block_count().unwrap(), 3);
    let descriptor = BlockDescriptor::decode(&store.read_full_block(block_offset(1)).unwrap()).unwrap();
    assert_eq!(descriptor.tag, DescriptorTag::Allocated);
    assert_eq!(descriptor.file_name, "doc.bin");
    assert_eq!(descriptor.file_size, 11);
}

#[test]
fn test_write_across_page_boundary() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();
    let data = pattern(10_000, 3);

    run(&service, &mut store, TxMode::Write, TxRequest::write("big", "big", 100, data.clone())).unwrap();
    // 100 + 10_000 bytes need three pages
    assert_eq!(store.block_count().unwrap(), 2 + 3);

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("big", 100, 10_000)).unwrap();
    assert_eq!(read, data);

    let head = run(&service, &mut store, TxMode::Read, TxRequest::read("big", 0, 100)).unwrap();
    assert_eq!(head, vec![0u8; 100]);
}

#[test]
fn test_overwrite_reuses_pages() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    run(&service, &mut store, TxMode::Write, TxRequest::write("f", "f", 0, vec![b'a'; 20])).unwrap();
    let blocks = store.block_count().unwrap();

    run(&service, &mut store, TxMode::Write, TxRequest::write("f", "f", PAYLOAD_LEN as u64 - 2, b"ZZZZ".to_vec())).unwrap();
    // Straddles into a second page: exactly one new block
    assert_eq!(store.block_count().unwrap(), blocks + 1);

    run(&service, &mut store, TxMode::Write, TxRequest::write("f", "f", 5, b"bbb".to_vec())).unwrap();
    assert_eq!(store.block_count().unwrap(), blocks + 1);

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("f", 0, 10)).unwrap();
    assert_eq!(read, b"aaaaabbbaa".to_vec());

    let tail = run(&service, &mut store, TxMode::Read, TxRequest::read("f", PAYLOAD_LEN as u64 - 2, 10)).unwrap();
    assert_eq!(tail, b"ZZZZ".to_vec());
}

#[test]
fn test_sparse_object_reads_zeros() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();
    let offset = 2 * PAYLOAD_LEN as u64 + 5;

    run(&service, &mut store, TxMode::Write, TxRequest::write("sparse", "s", offset, b"end".to_vec())).unwrap();
    // Only the touched page is allocated
    assert_eq!(store.block_count().unwrap(), 3);

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("sparse", 0, offset + 3)).unwrap();
    assert_eq!(read.len() as u64, offset + 3);
    assert!(read[..offset as usize].iter().all(|&b| b == 0));
    assert_eq!(&read[offset as usize..], b"end");
}

#[test]
fn test_read_past_end_is_empty() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    run(&service, &mut store, TxMode::Write, TxRequest::write("f", "f", 0, b"abc".to_vec())).unwrap();
    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("f", 3, 10)).unwrap();
    assert!(read.is_empty());
    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("f", 1, 0)).unwrap();
    assert!(read.is_empty());
}

#[test]
fn test_unknown_object_is_not_found() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    for mode in [TxMode::Read, TxMode::Close, TxMode::Delete] {
        let result = run(&service, &mut store, mode, TxRequest::read("ghost", 0, 1));
        assert!(matches!(result, Err(StorageError::NotFound(id)) if id == "ghost"));
    }
}

#[test]
fn test_closed_object_is_read_only() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    run(&service, &mut store, TxMode::Write, TxRequest::write("log", "log", 0, b"entry".to_vec())).unwrap();
    run(&service, &mut store, TxMode::Close, TxRequest::target("log")).unwrap();
    // Closing twice is harmless
    run(&service, &mut store, TxMode::Close, TxRequest::target("log")).unwrap();

    let result = run(&service, &mut store, TxMode::Write, TxRequest::write("log", "log", 5, b"more".to_vec()));
    assert!(matches!(result, Err(StorageError::Closed(_))));

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("log", 0, 100)).unwrap();
    assert_eq!(read, b"entry".to_vec());

    let descriptor = BlockDescriptor::decode(&store.read_full_block(block_offset(1)).unwrap()).unwrap();
    assert_eq!(descriptor.tag, DescriptorTag::Closed);
}

#[test]
fn test_delete_then_recreate() {
    let (_file, mut store) = fresh_store();
    let service = BlockStorageService::new();

    run(&service, &mut store, TxMode::Write, TxRequest::write("tmp", "tmp", 0, b"old contents".to_vec())).unwrap();
    run(&service, &mut store, TxMode::Delete, TxRequest::target("tmp")).unwrap();

    let result = run(&service, &mut store, TxMode::Read, TxRequest::read("tmp", 0, 10));
    assert!(matches!(result, Err(StorageError::NotFound(_))));

    let descriptor = BlockDescriptor::decode(&store.read_full_block(block_offset(1)).unwrap()).unwrap();
    assert_eq!(descriptor.tag, DescriptorTag::Deleted);

    run(&service, &mut store, TxMode::Write, TxRequest::write("tmp", "tmp", 4, b"new".to_vec())).unwrap();
    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("tmp", 0, 100)).unwrap();
    assert_eq!(read, b"\0\0\0\0new".to_vec());
}

#[test]
fn test_extent_map_rebuilt_after_reopen() {
    let (file, mut store) = fresh_store();
    let data = pattern(9_000, 11);
    {
        let service = BlockStorageService::new();
        run(&service, &mut store, TxMode::Write, TxRequest::write("keep", "keep", 0, data.clone())).unwrap();
        run(&service, &mut store, TxMode::Write, TxRequest::write("gone", "gone", 0, b"x".to_vec())).unwrap();
        run(&service, &mut store, TxMode::Write, TxRequest::write("frozen", "frozen", 0, b"ice".to_vec())).unwrap();
        run(&service, &mut store, TxMode::Close, TxRequest::target("frozen")).unwrap();
        run(&service, &mut store, TxMode::Delete, TxRequest::target("gone")).unwrap();
        run(&service, &mut store, TxMode::Write, TxRequest::write("gone", "gone", 0, b"reborn".to_vec())).unwrap();
    }
    drop(store);

    let mut store = BlockStore::open(file.path()).unwrap();
    let service = BlockStorageService::new();

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("keep", 0, 9_000)).unwrap();
    assert_eq!(read, data);

    let read = run(&service, &mut store, TxMode::Read, TxRequest::read("gone", 0, 100)).unwrap();
    assert_eq!(read, b"reborn".to_vec());

    let result = run(&service, &mut store, TxMode::Write, TxRequest::write("frozen", "frozen", 0, b"x".to_vec()));
    assert!(matches!(result, Err(StorageError::Closed(_))));
}

#[test]
fn test_store_without_header_is_uninitialized() {
    let file = NamedTempFile::new().unwrap();
    let mut store = BlockStore::open(file.path()).unwrap();
    let service = BlockStorageService::new();

    let result = run(&service, &mut store, TxMode::Write, TxRequest::write("f", "f", 0, b"x".to_vec()));
    assert!(matches!(result, Err(StorageError::Uninitialized)));
    assert_eq!(store.block_count().unwrap(), 0);
}

#[test]
fn test_response_encoding() {
    let done = TxResponse::Done {
        tx_id: 9,
        data: b"abc".to_vec(),
    };
    assert_eq!(TxResponse::from_bytes(&done.to_bytes().unwrap()).unwrap(), done);

    let failed = TxResponse::Failed {
        tx_id: None,
        reason: "Object not found: x".into(),
    };
    assert_eq!(TxResponse::from_bytes(&failed.to_bytes().unwrap()).unwrap(), failed);
}

async fn exchange(client: &TcpTransport, mode: TxMode, request: TxRequest) -> TxResponse {
    let body = request.encode(mode).unwrap();
    send_frame(client, ConnectionHandle::OUTBOUND, &body).await.unwrap();
    let reply = recv_frame(client, ConnectionHandle::OUTBOUND).await.unwrap();
    TxResponse::from_bytes(&reply).unwrap()
}

#[tokio::test]
async fn test_handle_request_over_tcp() {
    let (_file, store) = fresh_store();
    let store = Arc::new(Mutex::new(store));
    let service = Arc::new(BlockStorageService::new());

    let server = Arc::new(TcpTransport::listening_on(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let addr = server.listen(0).await.unwrap();

    let server_task = {
        let server = server.clone();
        let store = store.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            // Three cycles on one connection
            for _ in 0..3 {
                service
                    .handle_request(&store, server.as_ref(), conn)
                    .await
                    .unwrap();
            }
        })
    };

    let client = TcpTransport::connect(addr).await.unwrap();

    let reply = exchange(&client, TxMode::Write, TxRequest::write("net", "net", 0, b"over the wire".to_vec())).await;
    assert!(matches!(reply, TxResponse::Done { ref data, .. } if data.is_empty()));

    let reply = exchange(&client, TxMode::Read, TxRequest::read("missing", 0, 4)).await;
    match reply {
        TxResponse::Failed { tx_id, reason } => {
            assert!(tx_id.is_some());
            assert!(reason.contains("not found"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let reply = exchange(&client, TxMode::Read, TxRequest::read("net", 0, 64)).await;
    assert!(matches!(reply, TxResponse::Done { ref data, .. } if data == b"over the wire"));

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_bad_mode_gets_failed_response() {
    let (_file, store) = fresh_store();
    let store = Mutex::new(store);
    let service = BlockStorageService::new();

    let server = TcpTransport::listening_on(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = server.listen(0).await.unwrap();
    let client = TcpTransport::connect(addr).await.unwrap();
    let conn = server.accept().await.unwrap();

    send_frame(&client, ConnectionHandle::OUTBOUND, b"Qjunk").await.unwrap();
    service.handle_request(&store, &server, conn).await.unwrap();

    let reply = recv_frame(&client, ConnectionHandle::OUTBOUND).await.unwrap();
    assert!(matches!(
        TxResponse::from_bytes(&reply).unwrap(),
        TxResponse::Failed { tx_id: None, .. }
    ));
}

#[tokio::test]
async fn test_echo_service_is_byte_exact() {
    let (_file, store) = fresh_store();
    let store = Mutex::new(store);
    let service = EchoService::new();

    let server = TcpTransport::listening_on(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = server.listen(0).await.unwrap();
    let client = TcpTransport::connect(addr).await.unwrap();
    let conn = server.accept().await.unwrap();

    let payload = *b"\x00kdb\xffecho\x01\x02\x03";
    kdb_net::send_all(&client, ConnectionHandle::OUTBOUND, &payload).await.unwrap();
    service.handle_request(&store, &server, conn).await.unwrap();

    let echoed = kdb_net::recv_exact(&client, ConnectionHandle::OUTBOUND, payload.len()).await.unwrap();
    assert_eq!(&echoed[..], &payload[..]);
}

#[test]
fn test_echo_transactions_return_payload() {
    let (_file, mut store) = fresh_store();
    let service = EchoService::new();
    let tx = service.generate_tx(b"twelve bytes", TxMode::Write).unwrap();
    assert_eq!(tx.size, 12);
    assert_eq!(service.execute_tx(&mut store, &tx).unwrap(), b"twelve bytes".to_vec());
}
