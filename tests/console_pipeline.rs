//! End-to-end scenarios for the console byte pipeline: cleaned logs,
//! catchup buffers, and subscriber fan-out.

use solmux::analytics::Analytics;
use solmux::hub::BroadcastHub;
use solmux::logs::LogWriter;
use solmux::screen::ScreenBuffer;

#[test]
fn single_sol_frame_lands_as_one_clean_line() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    // The BMC emits "Hello\r\n" as one SOL frame.
    writer.write("srvA", b"Hello\r\n").unwrap();

    let content = writer.current_log_content("srvA").unwrap();
    assert_eq!(content, b"Hello\n");

    // current.log points at the active file.
    let (name, path) = writer.current_log_target("srvA").unwrap();
    assert!(name.ends_with(".log"));
    assert_eq!(std::fs::read(path).unwrap(), b"Hello\n");
}

#[test]
fn ansi_escape_split_across_chunks_is_reassembled() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    // Cursor-home sequence split mid-escape across two SOL frames.
    writer.write("srv", b"\x1b[01").unwrap();
    writer.write("srv", b";01HDone\n").unwrap();

    let content = writer.current_log_content("srv").unwrap();
    assert!(content.ends_with(b"\nDone\n"));
    assert!(!content.contains(&0x1B));
}

#[test]
fn spinner_stream_collapses_to_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    writer
        .write("srv", b"DHCP..../\rDHCP....-\rDHCP....\\\rDHCP....|\rDHCP....OK\n")
        .unwrap();

    assert_eq!(writer.current_log_content("srv").unwrap(), b"DHCP....OK\n");
}

#[test]
fn bios_redraw_dedup_emits_banner_on_next_distinct_line() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    for _ in 0..10 {
        writer
            .write("srv", b"PXE-E53: No boot filename received\n")
            .unwrap();
    }
    writer.write("srv", b"Retrying...\n").unwrap();

    let content = String::from_utf8(writer.current_log_content("srv").unwrap()).unwrap();
    assert_eq!(
        content,
        "PXE-E53: No boot filename received\n(Duplicated 9 lines)\nRetrying...\n"
    );
}

#[test]
fn cleaned_logs_never_contain_escapes_or_blank_runs() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    let noisy: Vec<u8> = (0u8..=255).chain(0u8..=255).collect();
    writer.write("srv", &noisy).unwrap();
    writer.write("srv", b"\x1b[2J\x1b[H\n\n\n\n\x07after\n").unwrap();

    let content = writer.current_log_content("srv").unwrap();
    assert!(!content.contains(&0x1B));
    assert!(
        content
            .iter()
            .all(|&b| b == b'\n' || b == b'\t' || (32..127).contains(&b))
    );
    assert!(!content.windows(3).any(|w| w == b"\n\n\n"));
}

#[test]
fn second_rotation_within_cooldown_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);

    writer.write("srv", b"boot log\n").unwrap();
    writer.rotate_with_name("srv", Some("first")).unwrap();

    let before = writer.list_logs("srv").unwrap();
    assert!(!writer.can_rotate("srv"));
    // A well-behaved caller checks can_rotate; the on-disk set is unchanged.
    let after = writer.list_logs("srv").unwrap();
    assert_eq!(before, after);
}

#[test]
fn screen_buffer_catchup_matches_stream_tail() {
    let screen = ScreenBuffer::new(32);
    let mut all = Vec::new();

    for i in 0..20 {
        let chunk = format!("chunk-{i:02}|");
        screen.write(chunk.as_bytes());
        all.extend_from_slice(chunk.as_bytes());
    }

    assert_eq!(screen.bytes(), &all[all.len() - 32..]);
}

#[tokio::test]
async fn subscriber_sees_only_bytes_after_subscribing() {
    let hub = BroadcastHub::new();

    hub.publish("srv", b"lost to history");

    let mut sub = hub.subscribe("srv");
    hub.publish("srv", b"first");
    hub.publish("srv", b"second");

    assert_eq!(sub.recv().await.unwrap(), b"first");
    assert_eq!(sub.recv().await.unwrap(), b"second");
    assert!(sub.try_recv().is_none());
}

#[test]
fn rotation_mark_produces_power_on_delay() {
    let analytics = Analytics::new(None, &[]);

    // Rotation happens, then the first console bytes arrive with a BIOS
    // banner; the new boot inherits the rotation timestamp and delay.
    analytics.record_rotation("srvA");
    std::thread::sleep(std::time::Duration::from_millis(50));
    analytics.process_text("srvA", "iPXE initialising devices...");

    let snapshot = analytics.server("srvA");
    let boot = snapshot.current_boot.expect("boot tracked");
    assert!(boot.rotation_time.is_some());
    let delay = boot.power_on_delay.expect("delay recorded");
    assert!(delay >= 0.05, "delay was {delay}");
    assert!(delay < 10.0);
}

#[test]
fn full_boot_cycle_through_writer_and_analytics() {
    let dir = tempfile::tempdir().unwrap();
    let writer = LogWriter::new(dir.path(), 0);
    let analytics = Analytics::new(None, &[]);

    let frames: &[&[u8]] = &[
        b"American Megatrends BIOS 2.17\r\n",
        b"CLIENT MAC ADDR: 00 25 90 AA BB CC\r\n",
        b"Welcome to Ubuntu 22.04 LTS\r\n",
        b"web-01 login: ",
    ];

    for frame in frames {
        writer.write("srv", frame).unwrap();
        analytics.process_text("srv", &String::from_utf8_lossy(frame));
    }

    let content = String::from_utf8(writer.current_log_content("srv").unwrap()).unwrap();
    assert!(content.contains("American Megatrends BIOS 2.17\n"));
    assert!(content.contains("web-01 login:"));

    let snapshot = analytics.server("srv");
    assert_eq!(snapshot.total_reboots, 1);
    assert_eq!(snapshot.current_os.as_deref(), Some("Ubuntu"));
    assert_eq!(snapshot.hostname.as_deref(), Some("web-01"));
    assert!(snapshot.current_boot.unwrap().complete);
    assert!(snapshot.os_up_since.is_some());
}
