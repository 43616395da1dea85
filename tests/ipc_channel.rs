use mpbench::backend::SharedRegion;
use mpbench::ipc::{connect_with_retry, Listener, SharedHandle, HANDLE_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

#[test]
fn test_connect_before_listen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.socket");

    let client = {
        let path = path.clone();
        thread::spawn(move || {
            let connection =
                connect_with_retry(&path, Duration::from_millis(5), Duration::from_secs(10))
                    .unwrap();
            let mut payload = [0u8; HANDLE_SIZE];
            let fd = connection.recv_with_descriptor(&mut payload).unwrap();
            (SharedHandle::from_bytes(payload), File::from(fd))
        })
    };

    thread::sleep(Duration::from_millis(100));
    let mut listener = Listener::bind(&path).unwrap();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"shared through SCM_RIGHTS").unwrap();
    let handle = SharedHandle::from_bytes([0x5a; HANDLE_SIZE]).with_descriptor(file.as_raw_fd());

    let connection = listener.accept(Duration::from_secs(10)).unwrap();
    connection
        .send_with_descriptor(handle.descriptor(), handle.as_bytes())
        .unwrap();

    let (received, mut received_file) = client.join().unwrap();
    assert_eq!(received, handle);

    // Same open file description: the offset is shared too.
    received_file.seek(SeekFrom::Start(0)).unwrap();
    let mut text = String::new();
    received_file.read_to_string(&mut text).unwrap();
    assert_eq!(text, "shared through SCM_RIGHTS");
    assert_eq!(file.stream_position().unwrap(), text.len() as u64);

    drop(listener);
    assert!(!path.exists());
}

#[test]
fn test_shared_memory_through_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.socket");
    let region = SharedRegion::create("ipc-channel-test", 4096).unwrap();
    region.write_at(128, b"hello").unwrap();
    let fd = region.fd().unwrap().as_raw_fd();

    let mut listener = Listener::bind(&path).unwrap();
    let client = {
        let path = path.clone();
        thread::spawn(move || {
            let connection =
                connect_with_retry(&path, Duration::from_millis(5), Duration::from_secs(10))
                    .unwrap();
            let mut payload = [0u8; 8];
            let fd = connection.recv_with_descriptor(&mut payload).unwrap();
            let mapped = SharedRegion::open(fd, u64::from_le_bytes(payload) as usize).unwrap();
            let mut got = [0u8; 5];
            mapped.read_at(128, &mut got).unwrap();
            mapped.write_at(0, b"ack").unwrap();
            got
        })
    };

    let connection = listener.accept(Duration::from_secs(10)).unwrap();
    connection
        .send_with_descriptor(fd, &(region.len() as u64).to_le_bytes())
        .unwrap();

    assert_eq!(&client.join().unwrap(), b"hello");
    let mut ack = [0u8; 3];
    region.read_at(0, &mut ack).unwrap();
    assert_eq!(&ack, b"ack");
}
