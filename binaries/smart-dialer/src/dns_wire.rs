//! Thin helpers around the `simple_dns` wire codec: building case-randomized A/CNAME queries
//! with an EDNS0 OPT record, and pulling the bits the prober (component C) cares about back out
//! of a response. The actual wire encode/decode is `simple_dns`'s job; this module only shapes
//! the messages the Smart Dialer sends and reads.

use std::net::IpAddr;

use rand::Rng;
use simple_dns::{
    rdata::{OptCodes, RData, OPT},
    Name, Packet, Question, CLASS, QCLASS, QTYPE, TYPE,
};

/// The EDNS0 UDP payload size advertised in every outgoing query, per DNS Flag Day 2020.
pub const EDNS0_UDP_PAYLOAD_SIZE: u16 = 1232;

/// Flips the case of every ASCII letter in `name` independently with probability 0.5. Many
/// recursive resolvers echo the case of the question name back verbatim; many on-path censors
/// that forge answers do not bother, which is what the prober checks for.
pub fn randomize_case(name: &str) -> String {
    let mut rng = rand::thread_rng();
    name.chars()
        .map(|c| {
            if c.is_ascii_alphabetic() && rng.gen_bool(0.5) {
                if c.is_ascii_uppercase() {
                    c.to_ascii_lowercase()
                } else {
                    c.to_ascii_uppercase()
                }
            } else {
                c
            }
        })
        .collect()
}

fn with_edns0(mut packet: Packet) -> Packet {
    packet.additional_records.push(simple_dns::ResourceRecord::new(
        Name::new_unchecked("."),
        CLASS::IN,
        0,
        RData::OPT(OPT {
            udp_packet_size: EDNS0_UDP_PAYLOAD_SIZE,
            ext_rcode_and_flags: 0,
            opt_codes: OptCodes::default(),
        }),
    ));
    packet
}

/// Builds a single-question, recursion-desired query with the given query name and type, plus
/// an EDNS0 OPT record advertising [`EDNS0_UDP_PAYLOAD_SIZE`].
pub fn build_query(id: u16, qname: &str, qtype: TYPE) -> anyhow::Result<Packet<'static>> {
    let mut packet = Packet::new_query(id);
    packet.questions.push(Question::new(
        Name::new(qname)?.into_owned(),
        QTYPE::TYPE(qtype),
        QCLASS::CLASS(CLASS::IN),
        false,
    ));
    Ok(with_edns0(packet))
}

/// A minimal random query id generator, one per probe.
pub fn random_query_id() -> u16 {
    rand::thread_rng().gen()
}

/// Every address carried by an A/AAAA answer in `packet`, regardless of question.
pub fn answer_addresses(packet: &Packet) -> Vec<IpAddr> {
    packet
        .answers
        .iter()
        .filter_map(|rr| match &rr.rdata {
            RData::A(a) => Some(IpAddr::V4((*a).into())),
            RData::AAAA(a) => Some(IpAddr::V6((*a).into())),
            _ => None,
        })
        .collect()
}

/// True if every answer record is a CNAME (and there is at least one).
pub fn answers_are_all_cname(packet: &Packet) -> bool {
    !packet.answers.is_empty()
        && packet
            .answers
            .iter()
            .all(|rr| matches!(rr.rdata, RData::CNAME(_)))
}

/// True if the authority (name server) section carries exactly one SOA record and there are no
/// answers at all -- the shape of a legitimate NXDOMAIN-like negative response to a CNAME probe.
pub fn is_empty_answer_with_single_soa(packet: &Packet) -> bool {
    packet.answers.is_empty()
        && packet
            .name_servers
            .iter()
            .filter(|rr| matches!(rr.rdata, RData::SOA(_)))
            .count()
            == 1
}

/// The question name as it appears on the wire, for byte-for-byte (case-sensitive) comparison
/// against the name that was sent.
pub fn first_question_name(packet: &Packet) -> Option<String> {
    packet.questions.first().map(|q| q.qname.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randomize_case_preserves_letters_ignoring_case() {
        let original = "Example.COM";
        let randomized = randomize_case(original);
        assert_eq!(randomized.to_lowercase(), original.to_lowercase());
    }

    #[test]
    fn build_query_sets_edns0_and_one_question() {
        let packet = build_query(1234, "example.com.", TYPE::A).unwrap();
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.additional_records.len(), 1);
        assert!(matches!(
            packet.additional_records[0].rdata,
            RData::OPT(_)
        ));
    }
}
