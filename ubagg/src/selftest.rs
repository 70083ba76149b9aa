//! Loopback run of two bonding jettys: every posted send is carried straight
//! into a receive on the other side.

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use ubagg_core::{
    BondConfig, CrStatus, JettyContext, JettyId, JfrWr, JfsWr, RecvEvent, RecvOutcome,
    SendDisposition, SendTicket, Sge, TargetJetty,
};

const PAYLOAD: u32 = 4096;

#[derive(Debug, Default)]
pub struct Report {
    pub delivered: u64,
    pub dropped: u64,
    pub rerouted: usize,
    /// Sends carried by each member.
    pub per_member: Vec<u64>,
}

struct Loopback {
    tx: JettyContext,
    rx: JettyContext,
    local: JettyId,
    target: TargetJetty,
}

impl Loopback {
    fn carry(&self, ticket: &SendTicket, report: &mut Report) -> Result<()> {
        let header = ticket.header.context("send carries no header")?;
        let recv = self
            .rx
            .post_recv(&[JfrWr::new(ticket.wr_id as u64, vec![Sge::new(0x10_0000, PAYLOAD)])])?;
        let wr_id = recv.first().context("no receive posted")?.wr_id;
        self.rx.write_recv_header(wr_id, &header.encode())?;
        let outcome = self.rx.complete_recv(&RecvEvent {
            wr_id,
            src: self.local,
            byte_len: PAYLOAD + 8,
            imm_data: 0,
            status: CrStatus::Success,
        })?;
        match outcome {
            RecvOutcome::Deliver(crs) => report.delivered += crs.len() as u64,
            RecvOutcome::Held => {}
            RecvOutcome::Dropped { reason, .. } => {
                debug!(msn = ticket.msn, ?reason, "receive dropped");
                report.dropped += 1;
            }
        }
        if let Some(n) = report.per_member.get_mut(ticket.member_idx) {
            *n += 1;
        }
        self.tx.complete_send(ticket.wr_id, CrStatus::Success)?;
        Ok(())
    }
}

pub fn run(cfg: &BondConfig, members: usize, count: u32, fail_member: bool) -> Result<Report> {
    if fail_member && members < 2 {
        bail!("--fail-member needs at least two members");
    }
    let local = JettyId::new("fe80::1".parse()?, 1, 0);
    let remote = JettyId::new("fe80::2".parse()?, 1, 0);
    let lb = Loopback {
        tx: JettyContext::new(members, cfg)?,
        rx: JettyContext::new(members, cfg)?,
        local,
        target: TargetJetty::new(remote, members),
    };
    let batch = (cfg.window_size.min(cfg.hdr_slots)) as usize;
    let mut report = Report {
        per_member: vec![0; members],
        ..Default::default()
    };
    let mut pending: Vec<SendTicket> = Vec::new();

    for i in 0..count {
        if pending.len() >= batch {
            for t in pending.drain(..) {
                lb.carry(&t, &mut report)?;
            }
        }
        let wr = JfsWr::send(u64::from(i), remote, vec![Sge::new(0x1000, PAYLOAD)]);
        if let SendDisposition::Ready(t) = lb.tx.post_send(&lb.target, &wr)? {
            pending.push(t);
        }
        if fail_member && i == count / 2 {
            let reroute = lb.tx.fail_member(0)?;
            info!(rerouted = reroute.tickets.len(), "member 0 failed");
            report.rerouted += reroute.tickets.len();
            for rt in reroute.tickets {
                if let Some(p) = pending.iter_mut().find(|p| p.wr_id == rt.wr_id) {
                    *p = rt;
                }
            }
        }
    }
    for t in pending.drain(..) {
        lb.carry(&t, &mut report)?;
    }
    Ok(report)
}
