use std::time::Duration;

use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use tokio::net::UdpSocket;
use zeroize::Zeroizing;

use crate::crypto::{SecretBytes, ct_eq, derive_aes_key_from_k2, derive_k1_k2};
use crate::error::{Error, HandshakeStep, Result};
use crate::protocol::{
    RakpMessage2, SecurityContext, algorithm, auth_hash_kind, build_open_session_request_payload,
    build_rakp_message_1_payload, build_rakp_message_3_payload, command, compute_sik,
    decode_ipmi_lan_response, decode_rmcpplus_packet, encode_ipmi15_packet,
    encode_ipmi_lan_request, encode_rmcpplus_packet, encrypt_payload_aes_cbc,
    integrity_hash_kind, parse_open_session_response_payload, parse_rakp_message_2_payload,
    parse_rakp_message_4_payload, payload_type, rakp2_key_exchange_auth_code,
    rakp3_key_exchange_auth_code, rakp4_integrity_check_value,
};
use crate::types::{PrivilegeLevel, RawResponse};

/// Per-step response deadline during bring-up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// DeactivatePayload gets a shorter budget; its response is advisory.
const DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(2);
/// Send attempts per handshake request (UDP is lossy).
const HANDSHAKE_ATTEMPTS: u32 = 2;

/// Maximum UDP datagram we accept from a BMC.
const MAX_PACKET_SIZE: usize = 4096;

/// Established RMCP+ session state for one SOL connection.
///
/// Produced by [`establish`]; consumed by the transport pumps, which guard it
/// with a mutex (the write and keepalive pumps both allocate sequence numbers).
#[derive(Debug)]
pub(crate) struct SolSession {
    /// Our randomly chosen console session id.
    pub(crate) console_session_id: u32,
    /// The BMC-assigned (managed system) session id.
    pub(crate) bmc_session_id: u32,
    pub(crate) security: SecurityContext,
    pub(crate) integrity_enabled: bool,
    pub(crate) confidentiality_enabled: bool,
    /// Negotiated maximum outbound SOL payload size (sub-header included).
    pub(crate) max_outbound: u16,
    next_out_seq: u32,
    rq_seq: u8,
}

impl SolSession {
    /// Next RMCP+ session sequence. Stays 0 while integrity is off; increases
    /// monotonically once an integrity trailer is in play.
    pub(crate) fn allocate_out_seq(&mut self) -> u32 {
        if !self.integrity_enabled {
            return 0;
        }
        let current = self.next_out_seq;
        self.next_out_seq = self.next_out_seq.wrapping_add(1);
        current
    }

    fn allocate_rq_seq(&mut self) -> u8 {
        // rq_seq is 6-bit. We keep a u8 and wrap at 64.
        let current = self.rq_seq;
        self.rq_seq = (self.rq_seq + 1) & 0x3F;
        current
    }

    /// Build a session-wrapped IPMI LAN request, returning `(rq_seq, packet)`.
    pub(crate) fn build_ipmi_request(
        &mut self,
        netfn: u8,
        cmd: u8,
        data: &[u8],
    ) -> Result<(u8, Vec<u8>)> {
        let rq_seq = self.allocate_rq_seq();
        let ipmi_msg = encode_ipmi_lan_request(netfn, cmd, rq_seq, data)?;
        let payload = if self.confidentiality_enabled {
            let mut iv = [0u8; 16];
            rand::rng().fill_bytes(&mut iv);
            encrypt_payload_aes_cbc(&ipmi_msg, &self.security.aes_key, &iv)?
        } else {
            ipmi_msg
        };

        let session_seq = self.allocate_out_seq();
        let packet = encode_rmcpplus_packet(
            payload_type::IPMI,
            self.bmc_session_id,
            session_seq,
            &payload,
            self.integrity_enabled,
            self.confidentiality_enabled,
            Some(&self.security),
        )?;

        Ok((rq_seq, packet))
    }

    /// Wrap a SOL sub-packet for the wire.
    pub(crate) fn build_sol_packet(&mut self, sol_payload: &[u8]) -> Result<Vec<u8>> {
        let session_seq = self.allocate_out_seq();
        encode_rmcpplus_packet(
            payload_type::SOL,
            self.bmc_session_id,
            session_seq,
            sol_payload,
            self.integrity_enabled,
            false,
            Some(&self.security),
        )
    }

    #[cfg(test)]
    pub(crate) fn new_test(
        console_session_id: u32,
        bmc_session_id: u32,
        security: SecurityContext,
        integrity_enabled: bool,
        confidentiality_enabled: bool,
        max_outbound: u16,
    ) -> Self {
        Self {
            console_session_id,
            bmc_session_id,
            security,
            integrity_enabled,
            confidentiality_enabled,
            max_outbound,
            next_out_seq: 1,
            rq_seq: 0,
        }
    }

    /// Decode a session-wrapped IPMI response and validate its LAN framing.
    pub(crate) fn decode_ipmi_response(
        &self,
        netfn: u8,
        cmd: u8,
        rq_seq: u8,
        response_bytes: &[u8],
    ) -> Result<RawResponse> {
        let decoded = decode_rmcpplus_packet(response_bytes, Some(&self.security))?;
        if decoded.payload_type != payload_type::IPMI {
            return Err(Error::Protocol("unexpected RMCP+ payload type"));
        }

        // Some implementations may echo either SIDC or SIDM in the header. Accept either.
        if decoded.session_id != self.bmc_session_id
            && decoded.session_id != self.console_session_id
        {
            return Err(Error::Protocol("unexpected RMCP+ session id"));
        }

        decode_ipmi_lan_response(netfn, cmd, rq_seq, &decoded.payload)
    }
}

async fn send_recv(
    socket: &UdpSocket,
    request: &[u8],
    timeout: Duration,
    attempts: u32,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    for attempt in 0..attempts.max(1) {
        socket.send(request).await?;

        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_elapsed) => {
                if attempt + 1 == attempts.max(1) {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    Err(Error::Timeout)
}

/// Execute one IPMI command over the established session and return the raw response.
pub(crate) async fn execute_ipmi(
    socket: &UdpSocket,
    session: &mut SolSession,
    netfn: u8,
    cmd: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<RawResponse> {
    let (rq_seq, packet) = session.build_ipmi_request(netfn, cmd, data)?;
    let response = send_recv(socket, &packet, timeout, HANDSHAKE_ATTEMPTS).await?;
    session.decode_ipmi_response(netfn, cmd, rq_seq, &response)
}

/// Run the SOL bring-up over a connected UDP socket.
///
/// Steps: auth capabilities, RMCP+ open session, RAKP 1-4, set session
/// privilege, pre-activation deactivate, activate with the 0x80 retry ladder.
/// The socket is ready for the transport pumps when this returns.
pub(crate) async fn establish(
    socket: &UdpSocket,
    username: &[u8],
    password: &SecretBytes,
) -> Result<SolSession> {
    if username.len() > 16 {
        // Many BMCs limit username length to 16; the protocol allows larger, but interoperability suffers.
        return Err(Error::InvalidArgument(
            "username longer than 16 bytes is not widely supported",
        ));
    }

    let privilege = PrivilegeLevel::Administrator;

    // --- Get Channel Authentication Capabilities (IPMI 1.5 framing) ---
    get_channel_auth_caps(socket, privilege).await?;

    let mut rng = StdRng::from_os_rng();
    let console_session_id = rng.next_u32();
    let open_tag = (rng.next_u32() & 0xFF) as u8;

    // --- Open Session: offer RAKP-HMAC-SHA1, integrity none, confidentiality none ---
    let open_payload = build_open_session_request_payload(
        open_tag,
        privilege,
        console_session_id,
        algorithm::AUTH_RAKP_HMAC_SHA1,
        algorithm::INTEGRITY_NONE,
        algorithm::CONFIDENTIALITY_NONE,
    );

    let open_packet = encode_rmcpplus_packet(
        payload_type::OPEN_SESSION_REQUEST,
        0,
        0,
        &open_payload,
        false,
        false,
        None,
    )?;
    crate::debug::dump_hex("rmcp+ open request", &open_packet);

    let open_response_bytes = send_recv(socket, &open_packet, HANDSHAKE_TIMEOUT, HANDSHAKE_ATTEMPTS).await?;
    crate::debug::dump_hex("rmcp+ open response", &open_response_bytes);
    let open_decoded = decode_rmcpplus_packet(&open_response_bytes, None)?;
    if open_decoded.payload_type != payload_type::OPEN_SESSION_RESPONSE {
        return Err(Error::Protocol(
            "unexpected Open Session response payload type",
        ));
    }

    let open_resp = parse_open_session_response_payload(&open_decoded.payload)?;

    if open_resp.message_tag != open_tag {
        return Err(Error::Protocol(
            "Open Session response message tag mismatch",
        ));
    }
    if open_resp.status_code != 0x00 {
        return Err(Error::HandshakeRejected {
            step: HandshakeStep::OpenSession,
            status: open_resp.status_code,
        });
    }
    if open_resp.remote_console_session_id != console_session_id {
        return Err(Error::Protocol("Open Session remote session id mismatch"));
    }

    let auth = auth_hash_kind(open_resp.selected_auth_algorithm)?;
    let integrity = integrity_hash_kind(open_resp.selected_integrity_algorithm)?;
    let confidentiality = match open_resp.selected_confidentiality_algorithm {
        algorithm::CONFIDENTIALITY_NONE => false,
        algorithm::CONFIDENTIALITY_AES_CBC_128 => true,
        _ => return Err(Error::Unsupported("unknown confidentiality algorithm")),
    };

    let bmc_session_id = open_resp.managed_system_session_id;

    // --- RAKP Message 1 ---
    let rakp1_tag = (rng.next_u32() & 0xFF) as u8;
    let mut rm = [0u8; 16];
    rng.fill_bytes(&mut rm);

    let rakp1_payload =
        build_rakp_message_1_payload(rakp1_tag, bmc_session_id, &rm, privilege, username)?;

    let rakp1_packet = encode_rmcpplus_packet(
        payload_type::RAKP_1,
        0,
        0,
        &rakp1_payload,
        false,
        false,
        None,
    )?;

    let rakp2_bytes = send_recv(socket, &rakp1_packet, HANDSHAKE_TIMEOUT, HANDSHAKE_ATTEMPTS).await?;
    crate::debug::dump_hex("rmcp+ rakp2 response", &rakp2_bytes);
    let rakp2_decoded = decode_rmcpplus_packet(&rakp2_bytes, None)?;
    if rakp2_decoded.payload_type != payload_type::RAKP_2 {
        return Err(Error::Protocol("unexpected RAKP message 2 payload type"));
    }

    let rakp2: RakpMessage2 = parse_rakp_message_2_payload(&rakp2_decoded.payload, auth)?;

    if rakp2.message_tag != rakp1_tag {
        return Err(Error::Protocol("RAKP message 2 tag mismatch"));
    }
    if rakp2.status_code != 0x00 {
        return Err(Error::HandshakeRejected {
            step: HandshakeStep::Rakp12,
            status: rakp2.status_code,
        });
    }
    if rakp2.remote_console_session_id != console_session_id {
        return Err(Error::Protocol("RAKP message 2 remote session id mismatch"));
    }

    // --- Verify RAKP Message 2 auth code (HMAC(K[UID], ...)) ---
    // One-key login: Kg is the user password, right-padded with NULs to 20 bytes.
    let user_key = Zeroizing::new(password.to_user_key());

    let expected_rakp2_auth = rakp2_key_exchange_auth_code(
        auth,
        &*user_key,
        console_session_id,
        bmc_session_id,
        &rm,
        &rakp2.bmc_random,
        &rakp2.bmc_guid,
        privilege,
        username,
    )?;
    if !ct_eq(&expected_rakp2_auth, &rakp2.key_exchange_auth_code) {
        return Err(Error::AuthenticationFailed(
            "RAKP message 2 authentication code mismatch",
        ));
    }

    // --- Compute SIK (HMAC(Kg, RM | RC | Role | ULen | UName)) and derive K1/K2 ---
    let sik = Zeroizing::new(compute_sik(
        auth,
        &*user_key,
        &rm,
        &rakp2.bmc_random,
        privilege,
        username,
    )?);
    let (k1, k2) = derive_k1_k2(auth, &sik)?;
    let security = SecurityContext {
        integrity: integrity.unwrap_or(auth),
        k1,
        aes_key: derive_aes_key_from_k2(&k2),
    };

    // --- RAKP Message 3 ---
    let rakp3_tag = (rng.next_u32() & 0xFF) as u8;

    let rakp3_auth = rakp3_key_exchange_auth_code(
        auth,
        &*user_key,
        &rakp2.bmc_random,
        console_session_id,
        privilege,
        username,
    )?;
    let rakp3_payload = build_rakp_message_3_payload(rakp3_tag, bmc_session_id, &rakp3_auth);
    let rakp3_packet = encode_rmcpplus_packet(
        payload_type::RAKP_3,
        0,
        0,
        &rakp3_payload,
        false,
        false,
        None,
    )?;

    let rakp4_bytes = send_recv(socket, &rakp3_packet, HANDSHAKE_TIMEOUT, HANDSHAKE_ATTEMPTS).await?;
    crate::debug::dump_hex("rmcp+ rakp4 response", &rakp4_bytes);
    let rakp4_decoded = decode_rmcpplus_packet(&rakp4_bytes, None)?;
    if rakp4_decoded.payload_type != payload_type::RAKP_4 {
        return Err(Error::Protocol("unexpected RAKP message 4 payload type"));
    }

    let rakp4 = parse_rakp_message_4_payload(&rakp4_decoded.payload)?;

    if rakp4.message_tag != rakp3_tag {
        return Err(Error::Protocol("RAKP message 4 tag mismatch"));
    }
    if rakp4.status_code != 0x00 {
        return Err(Error::HandshakeRejected {
            step: HandshakeStep::Rakp34,
            status: rakp4.status_code,
        });
    }
    if rakp4.remote_console_session_id != console_session_id {
        return Err(Error::Protocol("RAKP message 4 remote session id mismatch"));
    }

    // --- Verify RAKP Message 4 ICV: HMAC(SIK, RM | SIDC | GUIDC), truncated ---
    // A few BMCs omit the ICV entirely when no integrity algorithm was
    // negotiated; only verify when something came back.
    if !rakp4.integrity_check_value.is_empty() {
        let expected_icv =
            rakp4_integrity_check_value(auth, &sik, &rm, bmc_session_id, &rakp2.bmc_guid)?;
        if !ct_eq(&expected_icv, &rakp4.integrity_check_value) {
            return Err(Error::AuthenticationFailed(
                "RAKP message 4 integrity check value mismatch",
            ));
        }
    }

    let mut session = SolSession {
        console_session_id,
        bmc_session_id,
        security,
        integrity_enabled: integrity.is_some(),
        confidentiality_enabled: confidentiality,
        max_outbound: 0,
        next_out_seq: 1,
        rq_seq: 0,
    };

    tracing::debug!(
        console_session_id = format_args!("{console_session_id:#010x}"),
        bmc_session_id = format_args!("{bmc_session_id:#010x}"),
        auth = ?auth,
        integrity = ?integrity,
        confidentiality,
        "RMCP+ session established"
    );

    // --- Set Session Privilege Level (required by some BMCs before SOL) ---
    set_session_privilege(socket, &mut session, privilege).await?;

    // --- Clear stale payload state, then activate SOL ---
    let _ = deactivate_sol(socket, &mut session).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let max_outbound = activate_sol_with_retry(socket, &mut session).await?;
    session.max_outbound = max_outbound;

    tracing::debug!(max_outbound, "SOL payload activated");

    Ok(session)
}

async fn get_channel_auth_caps(socket: &UdpSocket, privilege: PrivilegeLevel) -> Result<()> {
    // Channel 0x0E = "this channel", bit 7 requests IPMI v2.0 extended data.
    let data = [0x0E | 0x80, privilege.as_u8() & 0x0F];
    let msg = encode_ipmi_lan_request(command::NETFN_APP, command::GET_CHANNEL_AUTH_CAPS, 0, &data)?;
    let packet = encode_ipmi15_packet(0, 0, &msg);

    let resp = send_recv(socket, &packet, HANDSHAKE_TIMEOUT, HANDSHAKE_ATTEMPTS).await?;

    // RMCP(4) + IPMI 1.5 session header(10) + LAN message. The parsed contents
    // are advisory; a well-formed response is all we need.
    if resp.len() < 14 + 8 {
        return Err(Error::TruncatedInput("auth caps response too short"));
    }
    let lan = decode_ipmi_lan_response(
        command::NETFN_APP,
        command::GET_CHANNEL_AUTH_CAPS,
        0,
        &resp[14..],
    )?;
    if lan.completion_code != 0x00 {
        return Err(Error::HandshakeRejected {
            step: HandshakeStep::AuthCapabilities,
            status: lan.completion_code,
        });
    }
    Ok(())
}

async fn set_session_privilege(
    socket: &UdpSocket,
    session: &mut SolSession,
    privilege: PrivilegeLevel,
) -> Result<()> {
    let resp = execute_ipmi(
        socket,
        session,
        command::NETFN_APP,
        command::SET_SESSION_PRIVILEGE,
        &[privilege.as_u8() & 0x0F],
        HANDSHAKE_TIMEOUT,
    )
    .await?;

    if resp.completion_code != 0x00 {
        return Err(Error::HandshakeRejected {
            step: HandshakeStep::SetPrivilege,
            status: resp.completion_code,
        });
    }
    Ok(())
}

/// SOL payload instance used by this client (first and only instance).
pub(crate) const SOL_PAYLOAD_INSTANCE: u8 = 0x01;

/// Deactivate the SOL payload. The response is advisory; callers ignore errors
/// when this is used for pre-activation cleanup.
pub(crate) async fn deactivate_sol(socket: &UdpSocket, session: &mut SolSession) -> Result<()> {
    let data = [
        payload_type::SOL,
        SOL_PAYLOAD_INSTANCE,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    execute_ipmi(
        socket,
        session,
        command::NETFN_APP,
        command::DEACTIVATE_PAYLOAD,
        &data,
        DEACTIVATE_TIMEOUT,
    )
    .await?;
    Ok(())
}

/// Close the RMCP+ session.
pub(crate) async fn close_session(socket: &UdpSocket, session: &mut SolSession) -> Result<()> {
    let data = session.bmc_session_id.to_le_bytes();
    execute_ipmi(
        socket,
        session,
        command::NETFN_APP,
        command::CLOSE_SESSION,
        &data,
        DEACTIVATE_TIMEOUT,
    )
    .await?;
    Ok(())
}

async fn activate_sol(socket: &UdpSocket, session: &mut SolSession) -> Result<u16> {
    let data = [
        payload_type::SOL,
        SOL_PAYLOAD_INSTANCE,
        0x00, // aux data: no special options
        0x00,
        0x00,
        0x00,
    ];
    let resp = execute_ipmi(
        socket,
        session,
        command::NETFN_APP,
        command::ACTIVATE_PAYLOAD,
        &data,
        HANDSHAKE_TIMEOUT,
    )
    .await?;

    if resp.completion_code != 0x00 {
        return Err(Error::ActivationFailed {
            cc: resp.completion_code,
        });
    }

    // The negotiated outbound payload size sits at offset 6 of the response
    // data. Some BMCs (Dell iDRAC) return no response data at all.
    let mut max_outbound = 0u16;
    if resp.data.len() >= 8 {
        max_outbound = u16::from_le_bytes([resp.data[6], resp.data[7]]);
    }
    if max_outbound == 0 || max_outbound > 255 {
        max_outbound = 200; // Default safe value
    }

    Ok(max_outbound)
}

/// Activate SOL, climbing the retry ladder on "payload already active" (0x80):
/// deactivate + 1 s settle + retry, then SOL-channel disable/enable + retry.
async fn activate_sol_with_retry(socket: &UdpSocket, session: &mut SolSession) -> Result<u16> {
    match activate_sol(socket, session).await {
        Ok(max) => return Ok(max),
        Err(Error::ActivationFailed { cc: 0x80 }) => {}
        Err(e) => return Err(e),
    }

    tracing::debug!("SOL payload already active, force-deactivating and retrying");
    let _ = deactivate_sol(socket, session).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    match activate_sol(socket, session).await {
        Ok(max) => return Ok(max),
        Err(Error::ActivationFailed { cc: 0x80 }) => {}
        Err(e) => return Err(e),
    }

    tracing::debug!("force-deactivate failed, disabling and re-enabling SOL");
    disable_enable_sol(socket, session).await;

    match activate_sol(socket, session).await {
        Ok(max) => Ok(max),
        Err(Error::ActivationFailed { cc: 0x80 }) => Err(Error::ActivationBusy),
        Err(e) => Err(e),
    }
}

/// Toggle the SOL Enable configuration parameter off and on. Best effort:
/// completion codes are ignored, this only exists to dislodge a wedged payload.
async fn disable_enable_sol(socket: &UdpSocket, session: &mut SolSession) {
    const SOL_CHANNEL_CURRENT: u8 = 0x0E;
    const PARAM_SOL_ENABLE: u8 = 0x01;

    for value in [0x00u8, 0x01] {
        let data = [SOL_CHANNEL_CURRENT, PARAM_SOL_ENABLE, value];
        let _ = execute_ipmi(
            socket,
            session,
            command::NETFN_TRANSPORT,
            command::SET_SOL_CONFIG,
            &data,
            DEACTIVATE_TIMEOUT,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashKind;

    fn test_session(integrity: bool) -> SolSession {
        SolSession {
            console_session_id: 0x01020304,
            bmc_session_id: 0x0A0B0C0D,
            security: SecurityContext {
                integrity: HashKind::Sha1,
                k1: vec![0u8; 20],
                aes_key: [0u8; 16],
            },
            integrity_enabled: integrity,
            confidentiality_enabled: false,
            max_outbound: 200,
            next_out_seq: 1,
            rq_seq: 0,
        }
    }

    #[test]
    fn session_seq_stays_zero_without_integrity() {
        let mut s = test_session(false);
        assert_eq!(s.allocate_out_seq(), 0);
        assert_eq!(s.allocate_out_seq(), 0);
    }

    #[test]
    fn session_seq_increases_with_integrity() {
        let mut s = test_session(true);
        assert_eq!(s.allocate_out_seq(), 1);
        assert_eq!(s.allocate_out_seq(), 2);
        assert_eq!(s.allocate_out_seq(), 3);
    }

    #[test]
    fn rq_seq_wraps_at_64() {
        let mut s = test_session(false);
        for expected in 0..64u8 {
            assert_eq!(s.allocate_rq_seq(), expected);
        }
        assert_eq!(s.allocate_rq_seq(), 0);
    }

    #[test]
    fn ipmi_request_roundtrips_through_decode() {
        let mut s = test_session(false);
        let (rq_seq, packet) = s
            .build_ipmi_request(command::NETFN_APP, command::GET_DEVICE_ID, &[])
            .expect("build");
        assert_eq!(rq_seq, 0);

        let decoded = decode_rmcpplus_packet(&packet, None).expect("decode");
        assert_eq!(decoded.payload_type, payload_type::IPMI);
        assert_eq!(decoded.session_id, 0x0A0B0C0D);
        // GetDeviceID request: 7 bytes of LAN message.
        assert_eq!(decoded.payload.len(), 7);
    }

    // A minimal in-process BMC speaking just enough RMCP+ to complete the
    // bring-up: auth caps, open session, RAKP 1-4 with real HMACs, then
    // completion-code-zero answers for the session commands.
    mod fake_bmc {
        use super::*;
        use crate::crypto::normalize_user_key;

        pub const BMC_SESSION_ID: u32 = 0x11223344;
        pub const MAX_OUTBOUND: u16 = 220;
        pub const USERNAME: &[u8] = b"ADMIN";
        pub const PASSWORD: &[u8] = b"ADMIN";

        const BMC_RANDOM: [u8; 16] = [0xCC; 16];
        const BMC_GUID: [u8; 16] = [0xDD; 16];

        fn algorithm_block(block_type: u8, alg: u8) -> [u8; 8] {
            [block_type, 0, 0, 0x08, alg, 0, 0, 0]
        }

        fn lan_response(netfn: u8, cmd: u8, rq_seq: u8, cc: u8, data: &[u8]) -> Vec<u8> {
            let netfn_lun = (netfn + 1) << 2;
            let csum1 = (!(0x81u8.wrapping_add(netfn_lun))).wrapping_add(1);

            let mut msg = vec![0x81, netfn_lun, csum1, 0x20, rq_seq << 2, cmd, cc];
            msg.extend_from_slice(data);

            let sum = msg[3..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            msg.push((!sum).wrapping_add(1));
            msg
        }

        pub async fn serve(socket: UdpSocket) {
            let mut buf = vec![0u8; 4096];
            let mut console_sid = 0u32;
            let mut console_random = [0u8; 16];

            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let packet = &buf[..n];

                let reply = if packet.len() > 4 && packet[4] == 0x00 {
                    // IPMI 1.5 framing: Get Channel Authentication Capabilities.
                    let request = &packet[14..];
                    let rq_seq = request[4] >> 2;
                    let msg = lan_response(0x06, 0x38, rq_seq, 0x00, &[0x0E, 0x80 | 0x14, 0x3D, 0x03, 0, 0, 0, 0]);
                    encode_ipmi15_packet(0, 0, &msg)
                } else {
                    let payload_len = u16::from_le_bytes([packet[14], packet[15]]) as usize;
                    let payload = &packet[16..16 + payload_len];

                    match packet[5] & 0x3F {
                        payload_type::OPEN_SESSION_REQUEST => {
                            console_sid = u32::from_le_bytes(payload[4..8].try_into().unwrap());

                            let mut resp = vec![payload[0], 0x00, 0x04, 0x00];
                            resp.extend_from_slice(&console_sid.to_le_bytes());
                            resp.extend_from_slice(&BMC_SESSION_ID.to_le_bytes());
                            resp.extend_from_slice(&algorithm_block(0x00, algorithm::AUTH_RAKP_HMAC_SHA1));
                            resp.extend_from_slice(&algorithm_block(0x01, algorithm::INTEGRITY_NONE));
                            resp.extend_from_slice(&algorithm_block(0x02, algorithm::CONFIDENTIALITY_NONE));

                            encode_rmcpplus_packet(
                                payload_type::OPEN_SESSION_RESPONSE, 0, 0, &resp, false, false, None,
                            )
                            .unwrap()
                        }
                        payload_type::RAKP_1 => {
                            console_random.copy_from_slice(&payload[8..24]);
                            let ulen = payload[27] as usize;
                            let username = &payload[28..28 + ulen];

                            let user_key = normalize_user_key(PASSWORD);
                            let auth_code = rakp2_key_exchange_auth_code(
                                HashKind::Sha1,
                                &user_key,
                                console_sid,
                                BMC_SESSION_ID,
                                &console_random,
                                &BMC_RANDOM,
                                &BMC_GUID,
                                PrivilegeLevel::Administrator,
                                username,
                            )
                            .unwrap();

                            let mut resp = vec![payload[0], 0x00, 0x00, 0x00];
                            resp.extend_from_slice(&console_sid.to_le_bytes());
                            resp.extend_from_slice(&BMC_RANDOM);
                            resp.extend_from_slice(&BMC_GUID);
                            resp.extend_from_slice(&auth_code);

                            encode_rmcpplus_packet(payload_type::RAKP_2, 0, 0, &resp, false, false, None)
                                .unwrap()
                        }
                        payload_type::RAKP_3 => {
                            let user_key = normalize_user_key(PASSWORD);
                            let sik = compute_sik(
                                HashKind::Sha1,
                                &user_key,
                                &console_random,
                                &BMC_RANDOM,
                                PrivilegeLevel::Administrator,
                                USERNAME,
                            )
                            .unwrap();
                            let icv = rakp4_integrity_check_value(
                                HashKind::Sha1,
                                &sik,
                                &console_random,
                                BMC_SESSION_ID,
                                &BMC_GUID,
                            )
                            .unwrap();

                            let mut resp = vec![payload[0], 0x00, 0x00, 0x00];
                            resp.extend_from_slice(&console_sid.to_le_bytes());
                            resp.extend_from_slice(&icv);

                            encode_rmcpplus_packet(payload_type::RAKP_4, 0, 0, &resp, false, false, None)
                                .unwrap()
                        }
                        payload_type::IPMI => {
                            let netfn = payload[1] >> 2;
                            let rq_seq = payload[4] >> 2;
                            let cmd = payload[5];

                            let data: &[u8] = if cmd == command::ACTIVATE_PAYLOAD {
                                // max outbound at response data offset 6.
                                &[0, 0, 0, 0, 0, 0, (MAX_OUTBOUND & 0xFF) as u8, (MAX_OUTBOUND >> 8) as u8, 0, 0, 0, 0]
                            } else {
                                &[]
                            };

                            let msg = lan_response(netfn, cmd, rq_seq, 0x00, data);
                            encode_rmcpplus_packet(
                                payload_type::IPMI, console_sid, 0, &msg, false, false, None,
                            )
                            .unwrap()
                        }
                        _ => continue,
                    }
                };

                let _ = socket.send_to(&reply, peer).await;
            }
        }
    }

    #[tokio::test]
    async fn establish_completes_against_fake_bmc() {
        let bmc_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bmc_addr = bmc_socket.local_addr().unwrap();
        let server = tokio::spawn(fake_bmc::serve(bmc_socket));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(bmc_addr).await.unwrap();

        let password = SecretBytes::new(fake_bmc::PASSWORD.to_vec());
        let session = establish(&client, fake_bmc::USERNAME, &password)
            .await
            .expect("handshake succeeds");

        assert_eq!(session.bmc_session_id, fake_bmc::BMC_SESSION_ID);
        assert_eq!(session.max_outbound, fake_bmc::MAX_OUTBOUND);
        assert!(!session.integrity_enabled);
        assert!(!session.confidentiality_enabled);

        server.abort();
    }

    #[tokio::test]
    async fn establish_rejects_overlong_username() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect("127.0.0.1:9").await.unwrap();

        let password = SecretBytes::new(b"pw".to_vec());
        let err = establish(&socket, b"this-username-is-way-too-long", &password)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
