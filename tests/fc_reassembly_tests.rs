//! Fibre Channel tests
//!
//! Exchange tracking, sequence reassembly with streaming SEQ_CNT values,
//! bogus fragment detection, and FCP task interpretation across the frames
//! of one exchange.

use once_cell::sync::Lazy;
use san_dissect::fc::{f_ctl, fc_type, FrameKind};
use san_dissect::fcp::FcpIu;
use san_dissect::scsi::{peripheral_type, scsi_status};
use san_dissect::{
    Address, AnalysisSession, Annotation, Delimiters, DissectError, Endpoint, FcDissection,
    FcEncapsulation, FrameInfo, Preferences, SequenceOutcome,
};
use std::time::Duration;

// ============================================================================
// Test Configuration
// ============================================================================

static TEST_PREFS: Lazy<Preferences> = Lazy::new(|| {
    let contents = std::fs::read_to_string("test-config.toml")
        .expect("Failed to read test-config.toml - config file required");
    Preferences::from_toml_str(&contents).expect("Failed to parse test-config.toml")
});

fn new_session() -> AnalysisSession {
    let _ = env_logger::builder().is_test(true).try_init();
    AnalysisSession::builder()
        .preferences(TEST_PREFS.clone())
        .build()
        .expect("test preferences are valid")
}

// ============================================================================
// Frame builders
// ============================================================================

const INITIATOR: u32 = 0x01_0200;
const TARGET: u32 = 0x01_0100;

struct Fc {
    r_ctl: u8,
    fc_type: u8,
    f_ctl: u32,
    seq_id: u8,
    seq_cnt: u16,
    ox_id: u16,
}

impl Fc {
    fn fcp(r_ctl: u8, f_ctl: u32, ox_id: u16) -> Self {
        Fc {
            r_ctl,
            fc_type: fc_type::SCSI_FCP,
            f_ctl,
            seq_id: 0,
            seq_cnt: 0,
            ox_id,
        }
    }

    fn seq(mut self, seq_id: u8, seq_cnt: u16) -> Self {
        self.seq_id = seq_id;
        self.seq_cnt = seq_cnt;
        self
    }

    fn build(&self, payload: &[u8]) -> Vec<u8> {
        let responder = self.f_ctl & f_ctl::EXCHANGE_RESPONDER != 0;
        let (s_id, d_id) = if responder { (TARGET, INITIATOR) } else { (INITIATOR, TARGET) };
        let mut f = vec![0u8; 24];
        f[0] = self.r_ctl;
        f[1..4].copy_from_slice(&d_id.to_be_bytes()[1..]);
        f[5..8].copy_from_slice(&s_id.to_be_bytes()[1..]);
        f[8] = self.fc_type;
        f[9..12].copy_from_slice(&self.f_ctl.to_be_bytes()[1..]);
        f[12] = self.seq_id;
        f[14..16].copy_from_slice(&self.seq_cnt.to_be_bytes());
        f[16..18].copy_from_slice(&self.ox_id.to_be_bytes());
        f[18..20].copy_from_slice(&0xFFFFu16.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }
}

fn info(number: u32, ms: u64) -> FrameInfo {
    FrameInfo::new(
        number,
        Duration::from_millis(ms),
        Endpoint::new(Address::fc(INITIATOR), 0),
        Endpoint::new(Address::fc(TARGET), 0),
    )
}

fn encap(first: bool, last: bool) -> FcEncapsulation {
    FcEncapsulation {
        delimiters: Delimiters {
            first_of_sequence: first,
            last_of_sequence: last,
        },
        trailer_len: 0,
    }
}

fn single() -> FcEncapsulation {
    encap(true, true)
}

fn fcp_cmnd(cdb: &[u8], read: bool, dl: u32) -> Vec<u8> {
    let mut iu = vec![0u8; 32];
    iu[1] = 0x00;
    iu[11] = if read { 0x02 } else { 0x01 };
    iu[12..12 + cdb.len()].copy_from_slice(cdb);
    iu[28..32].copy_from_slice(&dl.to_be_bytes());
    iu
}

fn fcp_rsp(status: u8) -> Vec<u8> {
    let mut iu = vec![0u8; 24];
    iu[11] = status;
    iu
}

fn run(
    session: &mut AnalysisSession,
    number: u32,
    ms: u64,
    frame: &[u8],
    enc: FcEncapsulation,
) -> FcDissection {
    session
        .dissect_fc_frame(&info(number, ms), frame, enc)
        .expect("frame dissects")
}

// ============================================================================
// Sequence reassembly
// ============================================================================

fn two_frame_sequence(base: u16) -> (AnalysisSession, FcDissection, Vec<u8>) {
    let mut session = new_session();
    let first: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    let last = vec![0xEE; 100];

    let d1 = run(
        &mut session,
        1,
        0,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x1234).seq(1, base).build(&first),
        encap(true, false),
    );
    assert_eq!(d1.outcome, SequenceOutcome::Fragment { reassembled_in: None });
    assert!(d1.payload.is_none());

    let d2 = run(
        &mut session,
        2,
        1,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER | f_ctl::SEQ_LAST, 0x1234)
            .seq(1, base.wrapping_add(1))
            .build(&last),
        encap(false, true),
    );
    let mut expected = first;
    expected.extend_from_slice(&last);
    (session, d2, expected)
}

#[test]
fn test_streaming_seq_cnt_reassembles_like_zero_based() {
    let (_, streaming, expected) = two_frame_sequence(1000);
    let (_, zero_based, _) = two_frame_sequence(0);

    assert_eq!(streaming.payload.as_deref(), Some(expected.as_slice()));
    assert_eq!(zero_based.payload, streaming.payload);
    assert_eq!(expected.len(), 1124);
    assert!(streaming
        .annotations
        .contains(&Annotation::ReassembledFrom(vec![1, 2])));
}

#[test]
fn test_seq_cnt_wraps_around() {
    let (_, wrapped, expected) = two_frame_sequence(0xFFFF);
    assert_eq!(wrapped.payload, Some(expected));
}

#[test]
fn test_fragment_revisit_points_to_completing_frame() {
    let (mut session, _, _) = two_frame_sequence(1000);
    let first = Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x1234)
        .seq(1, 1000)
        .build(&[0u8; 1024]);
    let revisit = session
        .dissect_fc_frame(&info(1, 0).revisit(), &first, encap(true, false))
        .unwrap();
    assert_eq!(revisit.outcome, SequenceOutcome::Fragment { reassembled_in: Some(2) });
    assert!(revisit.annotations.contains(&Annotation::ReassembledIn(2)));
    assert_eq!(session.sequences().fragments().pending_len(), 0);
}

#[test]
fn test_bogus_last_fragment() {
    let mut session = new_session();
    run(
        &mut session,
        1,
        0,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x2000).seq(2, 500).build(&[1u8; 1024]),
        encap(true, false),
    );
    assert_eq!(session.sequences().fragments().pending_len(), 1);

    // Claims to end the sequence at the position of its first frame
    let bogus = run(
        &mut session,
        2,
        1,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x2000).seq(2, 500).build(&[2u8; 10]),
        encap(false, true),
    );
    assert_eq!(bogus.outcome, SequenceOutcome::Bogus);
    assert!(bogus.annotations.contains(&Annotation::BogusFragment));
    assert!(bogus.annotations.iter().any(|a| a.is_warning()));
    assert!(bogus.payload.is_none());
    assert_eq!(session.sequences().fragments().pending_len(), 1);
}

#[test]
fn test_link_service_frames_never_fragment() {
    let mut session = new_session();
    let abts = Fc {
        r_ctl: 0x81,
        fc_type: 0x00,
        f_ctl: 0,
        seq_id: 3,
        seq_cnt: 7,
        ox_id: 0x3000,
    };
    let d = run(&mut session, 1, 0, &abts.build(&[]), encap(true, false));
    assert_eq!(d.kind, FrameKind::BasicLinkService);
    assert_eq!(d.outcome, SequenceOutcome::Complete);
    assert_eq!(session.sequences().fragments().pending_len(), 0);
}

#[test]
fn test_reassembly_disabled() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut session = AnalysisSession::builder()
        .preferences(TEST_PREFS.clone())
        .fc_reassembly(false)
        .build()
        .unwrap();
    let d = run(
        &mut session,
        1,
        0,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x1234).seq(1, 0).build(&[9u8; 64]),
        encap(true, false),
    );
    assert_eq!(d.outcome, SequenceOutcome::Complete);
    assert_eq!(d.payload, Some(vec![9u8; 64]));
}

// ============================================================================
// Exchanges and FCP
// ============================================================================

#[test]
fn test_inquiry_exchange_end_to_end() {
    let mut session = new_session();
    let inquiry = [0x12, 0, 0, 0x04, 0x10, 0];
    let cmnd_frame = Fc::fcp(0x06, f_ctl::EXCHANGE_FIRST | f_ctl::SEQ_LAST, 0x0042)
        .build(&fcp_cmnd(&inquiry, true, 1036));

    let cmd = run(&mut session, 1, 10, &cmnd_frame, single());
    match &cmd.fcp {
        Some(FcpIu::Command(c)) => {
            assert!(c.read);
            assert_eq!(c.data_length, 1036);
            assert_eq!(c.scsi.as_ref().unwrap().name, "INQUIRY");
            assert_eq!(c.scsi.as_ref().unwrap().alloc_len, Some(0x0410));
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut inquiry_data = vec![0u8; 1024];
    inquiry_data[0] = peripheral_type::CHANGER;
    let data1 = run(
        &mut session,
        2,
        12,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER, 0x0042).seq(1, 0).build(&inquiry_data),
        encap(true, false),
    );
    assert!(data1.fcp.is_none());
    assert!(session.devices().is_empty());

    let data2 = run(
        &mut session,
        3,
        13,
        &Fc::fcp(0x01, f_ctl::EXCHANGE_RESPONDER | f_ctl::SEQ_LAST, 0x0042)
            .seq(1, 1)
            .build(&[0u8; 12]),
        encap(false, true),
    );
    match &data2.fcp {
        Some(FcpIu::Data { offset, len, device_type }) => {
            assert_eq!(*offset, 0);
            assert_eq!(*len, 1036);
            assert_eq!(*device_type, Some(peripheral_type::CHANGER));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.devices().lookup(&Address::fc(TARGET)), Some(peripheral_type::CHANGER));

    let rsp = run(
        &mut session,
        4,
        25,
        &Fc::fcp(0x07, f_ctl::EXCHANGE_RESPONDER | f_ctl::EXCHANGE_LAST | f_ctl::SEQ_LAST, 0x0042)
            .seq(2, 0)
            .build(&fcp_rsp(scsi_status::GOOD)),
        single(),
    );
    match &rsp.fcp {
        Some(FcpIu::Response(r)) => {
            assert_eq!(r.scsi.status, scsi_status::GOOD);
            assert_eq!(r.scsi.opcode, Some(0x12));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(rsp.annotations.contains(&Annotation::ExchangeFirstFrame(1)));
    assert!(rsp
        .annotations
        .contains(&Annotation::ExchangeTime(Duration::from_millis(15))));

    // Command revisited: last frame now known
    let again = session
        .dissect_fc_frame(&info(1, 10).revisit(), &cmnd_frame, single())
        .unwrap();
    assert!(again.annotations.contains(&Annotation::ExchangeLastFrame(4)));
    assert_eq!(session.exchanges().len(), 1);
}

#[test]
fn test_ox_id_reuse_rebinds_exchange() {
    let mut session = new_session();
    let cmnd = fcp_cmnd(&[0x00; 6], false, 0);
    let first = Fc::fcp(0x06, f_ctl::EXCHANGE_FIRST, 0x0777).build(&cmnd);
    let last = Fc::fcp(0x07, f_ctl::EXCHANGE_RESPONDER | f_ctl::EXCHANGE_LAST, 0x0777)
        .build(&fcp_rsp(scsi_status::GOOD));

    run(&mut session, 1, 0, &first, single());
    let old = run(&mut session, 2, 4, &last, single());
    assert!(old.annotations.contains(&Annotation::ExchangeTime(Duration::from_millis(4))));

    run(&mut session, 10, 100, &first, single());
    let new = run(&mut session, 11, 103, &last, single());
    assert!(new.annotations.contains(&Annotation::ExchangeFirstFrame(10)));
    assert!(!new.annotations.contains(&Annotation::ExchangeFirstFrame(1)));
    assert!(new.annotations.contains(&Annotation::ExchangeTime(Duration::from_millis(3))));
    assert_eq!(session.exchanges().len(), 1);
}

#[test]
fn test_short_fcp_payload_is_undissected() {
    let mut session = new_session();
    let d = run(
        &mut session,
        1,
        0,
        &Fc::fcp(0x06, f_ctl::EXCHANGE_FIRST, 0x0100).build(&[0u8; 10]),
        single(),
    );
    assert!(d.fcp.is_none());
    assert!(d.annotations.contains(&Annotation::Undissected(vec![0u8; 10])));
    assert_eq!(session.exchanges().len(), 1);
}

#[test]
fn test_truncated_header_is_bounds_error() {
    let mut session = new_session();
    let err = session
        .dissect_fc_frame(&info(1, 0), &[0u8; 20], single())
        .unwrap_err();
    assert!(matches!(err, DissectError::Bounds { .. }));
    assert!(session.conversations().is_empty());
}
