//! Replay a small synthetic capture twice
//!
//! The first pass feeds every frame in capture order, the way a capture
//! host does while loading a file. The second pass re-renders each frame
//! and prints the cross references that are only known once the whole
//! capture has been seen.
//!
//! Run with `RUST_LOG=debug` to see table updates.

use san_dissect::fc::f_ctl;
use san_dissect::iscsi::{flags, opcode, Bhs};
use san_dissect::{
    Address, AnalysisSession, Annotation, Delimiters, Endpoint, FcEncapsulation, FrameInfo,
    IscsiDissection,
};
use std::net::Ipv4Addr;
use std::time::Duration;

enum Payload {
    Iscsi(Vec<u8>),
    Fc(Vec<u8>, FcEncapsulation),
}

struct Captured {
    info: FrameInfo,
    payload: Payload,
}

fn iscsi_pdu(
    op: u8,
    pdu_flags: u8,
    itt: u32,
    setup: impl FnOnce(&mut Bhs),
    data: &[u8],
) -> Vec<u8> {
    let mut bhs = Bhs::new(op, pdu_flags, itt);
    bhs.data_length = data.len() as u32;
    setup(&mut bhs);
    let mut pdu = bhs.to_bytes().to_vec();
    pdu.extend_from_slice(data);
    pdu.resize(pdu.len().div_ceil(4) * 4, 0);
    pdu
}

/// Source and destination FC_IDs of a frame
#[derive(Clone, Copy)]
struct FcPath {
    s_id: u32,
    d_id: u32,
}

fn fc_frame(
    r_ctl: u8,
    fctl: u32,
    path: FcPath,
    ox_id: u16,
    (seq_id, seq_cnt): (u8, u16),
    payload: &[u8],
) -> Vec<u8> {
    let mut f = vec![0u8; 24];
    f[0] = r_ctl;
    f[1..4].copy_from_slice(&path.d_id.to_be_bytes()[1..]);
    f[5..8].copy_from_slice(&path.s_id.to_be_bytes()[1..]);
    f[8] = san_dissect::fc::fc_type::SCSI_FCP;
    f[9..12].copy_from_slice(&fctl.to_be_bytes()[1..]);
    f[12] = seq_id;
    f[14..16].copy_from_slice(&seq_cnt.to_be_bytes());
    f[16..18].copy_from_slice(&ox_id.to_be_bytes());
    f.extend_from_slice(payload);
    f
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

fn build_capture() -> Vec<Captured> {
    let initiator = Endpoint::new(Ipv4Addr::new(192, 168, 10, 5), 49152);
    let target = Endpoint::new(Ipv4Addr::new(192, 168, 10, 20), 3260);
    let at = |number: u32, ms: u64, src: Endpoint, dst: Endpoint| {
        FrameInfo::new(number, Duration::from_millis(ms), src, dst)
    };

    // iSCSI: READ(10) of one block, answered with Data-In and a response
    let read = iscsi_pdu(
        opcode::SCSI_COMMAND,
        flags::FINAL | flags::READ,
        0x10,
        |b| {
            b.set_field_u32(20, 512);
            for (i, v) in [0x28, 0, 0, 0, 0, 0x08, 0, 0, 1, 0].iter().enumerate() {
                b.set_byte(32 + i, *v);
            }
        },
        &[],
    );
    let data_in = iscsi_pdu(opcode::SCSI_DATA_IN, flags::FINAL, 0x10, |_| {}, &[0x5A; 512]);
    let response = iscsi_pdu(opcode::SCSI_RESPONSE, flags::FINAL, 0x10, |_| {}, &[]);

    // FC: INQUIRY whose data arrives in two frames
    let (fc_init, fc_tgt) = (0x0A_0100, 0x0A_0200);
    let fc_src = Endpoint::new(Address::fc(fc_init), 0);
    let fc_dst = Endpoint::new(Address::fc(fc_tgt), 0);
    let mut cmnd = vec![0u8; 32];
    cmnd[11] = 0x02;
    cmnd[12..18].copy_from_slice(&[0x12, 0, 0, 0x04, 0x24, 0]);
    cmnd[28..32].copy_from_slice(&1060u32.to_be_bytes());
    let mut inquiry = vec![0u8; 1024];
    inquiry[0] = 0x01; // tape
    let cmnd_fctl = f_ctl::EXCHANGE_FIRST | f_ctl::SEQ_LAST;
    let responder = f_ctl::EXCHANGE_RESPONDER;
    let to_tgt = FcPath {
        s_id: fc_init,
        d_id: fc_tgt,
    };
    let to_init = FcPath {
        s_id: fc_tgt,
        d_id: fc_init,
    };

    vec![
        Captured {
            info: at(1, 0, initiator, target),
            payload: Payload::Iscsi(read),
        },
        Captured {
            info: at(2, 0, fc_src, fc_dst),
            payload: Payload::Fc(
                fc_frame(0x06, cmnd_fctl, to_tgt, 0x0100, (0, 0), &cmnd),
                encap(true, true),
            ),
        },
        Captured {
            info: at(3, 2, target, initiator),
            payload: Payload::Iscsi(data_in),
        },
        Captured {
            info: at(4, 3, fc_dst, fc_src),
            payload: Payload::Fc(
                fc_frame(0x01, responder, to_init, 0x0100, (1, 0), &inquiry),
                encap(true, false),
            ),
        },
        Captured {
            info: at(5, 3, fc_dst, fc_src),
            payload: Payload::Fc(
                fc_frame(0x01, responder | f_ctl::SEQ_LAST, to_init, 0x0100, (1, 1), &[0u8; 36]),
                encap(false, true),
            ),
        },
        Captured {
            info: at(6, 4, target, initiator),
            payload: Payload::Iscsi(response),
        },
        Captured {
            info: at(7, 6, fc_dst, fc_src),
            payload: Payload::Fc(
                fc_frame(
                    0x07,
                    responder | f_ctl::EXCHANGE_LAST | f_ctl::SEQ_LAST,
                    to_init,
                    0x0100,
                    (2, 0),
                    &[0u8; 24],
                ),
                encap(true, true),
            ),
        },
    ]
}

fn dissect(
    session: &mut AnalysisSession,
    frame: &Captured,
    info: &FrameInfo,
) -> Result<Vec<Annotation>, Box<dyn std::error::Error>> {
    let notes = match &frame.payload {
        Payload::Iscsi(bytes) => match session.dissect_iscsi(info, bytes)? {
            IscsiDissection::Segment(seg) => seg
                .pdus
                .into_iter()
                .flat_map(|pdu| pdu.annotations)
                .chain(seg.annotations)
                .collect(),
            IscsiDissection::NotIscsi => Vec::new(),
        },
        Payload::Fc(bytes, encap) => session.dissect_fc_frame(info, bytes, *encap)?.annotations,
    };
    Ok(notes)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let capture = build_capture();
    let mut session = AnalysisSession::builder().target_port(3260).build()?;

    for frame in &capture {
        dissect(&mut session, frame, &frame.info)?;
    }
    println!(
        "First pass: {} conversations, {} exchanges, {} iSCSI tasks",
        session.conversations().len(),
        session.exchanges().len(),
        session.tasks().len()
    );

    for frame in &capture {
        println!("Frame {} ({} -> {})", frame.info.number, frame.info.src, frame.info.dst);
        for note in dissect(&mut session, frame, &frame.info.revisit())? {
            match note {
                Annotation::Undissected(bytes) => {
                    println!("  [{} bytes not interpreted]", bytes.len())
                }
                other => println!("  {}", other),
            }
        }
    }

    let fc_target = Address::fc(0x0A_0200);
    if let Some(devtype) = session.devices().lookup(&fc_target) {
        println!("FC target {} reports device type 0x{:02x}", fc_target, devtype);
    }

    Ok(())
}
