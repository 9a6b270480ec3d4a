// SPDX-License-Identifier: AGPL-3.0-only
//! Mapping from policy outcomes to packet-type-specific reply status codes.

use crate::machine::Outcome;
use tacplus_proto::dict::{acct_status, authen_status, author_status};
use tacplus_proto::{Attr, AttrList, PacketKind, Value};
use tracing::warn;

/// Write the reply status for `outcome` into the reply attribute list.
///
/// `Handled` means policy already set the status itself and must not be
/// overwritten. Outcomes with no row in the mapping are logged and dropped.
pub fn update_reply_status(kind: PacketKind, reply: &mut AttrList, outcome: Outcome) {
    match kind {
        PacketKind::Authen => {
            let status = match outcome {
                Outcome::Ok => authen_status::PASS,
                Outcome::Fail | Outcome::Reject | Outcome::Userlock => authen_status::FAIL,
                Outcome::Invalid => authen_status::ERROR,
                Outcome::Handled => return,
                other => {
                    warn!(outcome = ?other, "ignoring request to set authentication status");
                    return;
                }
            };
            reply.update(Attr::AuthenticationStatus, Value::U8(status));
        }
        PacketKind::Author => {
            let status = match outcome {
                Outcome::Ok => author_status::PASS_REPL,
                Outcome::Fail | Outcome::Reject | Outcome::Userlock => author_status::FAIL,
                Outcome::Invalid => author_status::ERROR,
                other => {
                    warn!(outcome = ?other, "ignoring request to set authorization status");
                    return;
                }
            };
            reply.update(Attr::AuthorizationStatus, Value::U8(status));
        }
        PacketKind::Acct => {
            let status = match outcome {
                Outcome::Ok => acct_status::SUCCESS,
                Outcome::Fail | Outcome::Reject | Outcome::Userlock | Outcome::Invalid => {
                    acct_status::ERROR
                }
                other => {
                    warn!(outcome = ?other, "ignoring request to set accounting status");
                    return;
                }
            };
            reply.update(Attr::AccountingStatus, Value::U8(status));
        }
    }
}
