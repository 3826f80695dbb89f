//! The CA worker holds every private key; relays hold none. A relay's
//! TLS stack signs through `RemoteKey`, which serialises the operation
//! onto the relay's CA channel and blocks until the reply. The CA side
//! resolves the key by objid and answers; any failure is a zero-length
//! reply, which the relay surfaces as a signing error and the handshake
//! aborts.

use std::{
    collections::HashMap,
    os::fd::OwnedFd,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, Pkcs1v15Encrypt, RsaPrivateKey,
};
use rustls::{
    pki_types::PrivateKeyDer,
    sign::{Signer, SigningKey},
    SignatureAlgorithm, SignatureScheme,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::{
    config::{GlobalConf, KeyAlgo, KeyPairMsg, Objid},
    event::{self, Event, Poller},
    ipc::{Channel, IpcError, MsgType},
    privsep::{self, CtlEvent, WorkerCtx, WorkerProc},
    tls,
};

/// Largest input a key operation will accept; anything bigger answers
/// with an empty reply per the error contract.
const MAX_OP_INPUT: usize = 2048;

#[derive(Debug, Serialize, Deserialize)]
pub struct CaKeyOp {
    pub objid: Objid,
    pub scheme: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaKeyDec {
    pub objid: Objid,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CaKeyResp {
    pub data: Vec<u8>,
}

pub fn scheme_to_wire(scheme: SignatureScheme) -> u16 {
    match scheme {
        SignatureScheme::RSA_PKCS1_SHA256 => 0x0401,
        SignatureScheme::RSA_PKCS1_SHA384 => 0x0501,
        SignatureScheme::RSA_PKCS1_SHA512 => 0x0601,
        SignatureScheme::ECDSA_NISTP256_SHA256 => 0x0403,
        SignatureScheme::ECDSA_NISTP384_SHA384 => 0x0503,
        SignatureScheme::RSA_PSS_SHA256 => 0x0804,
        SignatureScheme::RSA_PSS_SHA384 => 0x0805,
        SignatureScheme::RSA_PSS_SHA512 => 0x0806,
        SignatureScheme::ED25519 => 0x0807,
        _ => 0,
    }
}

pub fn scheme_from_wire(v: u16) -> Option<SignatureScheme> {
    Some(match v {
        0x0401 => SignatureScheme::RSA_PKCS1_SHA256,
        0x0501 => SignatureScheme::RSA_PKCS1_SHA384,
        0x0601 => SignatureScheme::RSA_PKCS1_SHA512,
        0x0403 => SignatureScheme::ECDSA_NISTP256_SHA256,
        0x0503 => SignatureScheme::ECDSA_NISTP384_SHA384,
        0x0804 => SignatureScheme::RSA_PSS_SHA256,
        0x0805 => SignatureScheme::RSA_PSS_SHA384,
        0x0806 => SignatureScheme::RSA_PSS_SHA512,
        0x0807 => SignatureScheme::ED25519,
        _ => return None,
    })
}

// --- CA side -------------------------------------------------------------

struct CaKey {
    signer: Arc<dyn SigningKey>,
    rsa: Option<RsaPrivateKey>,
}

/// The pkey table. Written once per CTL_START, read on every RPC.
#[derive(Default)]
pub struct CaStore {
    keys: HashMap<Objid, CaKey>,
}

impl CaStore {
    /// Parse and install the distributed keypairs, scrubbing the PEM
    /// buffers afterwards.
    pub fn install(&mut self, keypairs: &mut Vec<KeyPairMsg>) -> Result<()> {
        self.keys.clear();
        for kp in keypairs.iter_mut() {
            let der = tls::load_private_key(&kp.key_pem)
                .with_context(|| format!("key for relay {}", kp.objid))?;
            let signer = rustls::crypto::ring::sign::any_supported_type(&der)
                .map_err(|e| anyhow::anyhow!("unsupported key for relay {}: {e}", kp.objid))?;
            let rsa = match &der {
                PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der()).ok(),
                PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()).ok(),
                _ => None,
            };
            self.keys.insert(kp.objid, CaKey { signer, rsa });
            kp.key_pem.zeroize();
        }
        info!(keys = self.keys.len(), "private keys installed");
        Ok(())
    }

    pub fn key_algo(&self, objid: Objid) -> Option<KeyAlgo> {
        self.keys.get(&objid).map(|k| match k.signer.algorithm() {
            SignatureAlgorithm::RSA => KeyAlgo::Rsa,
            SignatureAlgorithm::ED25519 => KeyAlgo::Ed25519,
            _ => KeyAlgo::Ecdsa,
        })
    }

    /// Private-key signature. Empty on unknown objid, oversize input,
    /// unsupported scheme, or signer failure.
    pub fn sign(&self, objid: Objid, scheme: u16, data: &[u8]) -> Vec<u8> {
        if data.len() > MAX_OP_INPUT {
            debug!(objid, len = data.len(), "oversize sign input");
            return Vec::new();
        }
        let Some(key) = self.keys.get(&objid) else {
            debug!(objid, "sign request for unknown key");
            return Vec::new();
        };
        let Some(scheme) = scheme_from_wire(scheme) else {
            debug!(objid, scheme, "unknown signature scheme");
            return Vec::new();
        };
        let Some(signer) = key.signer.choose_scheme(&[scheme]) else {
            debug!(objid, ?scheme, "scheme not supported by key");
            return Vec::new();
        };
        match signer.sign(data) {
            Ok(sig) => sig,
            Err(e) => {
                debug!(objid, %e, "signing failed");
                Vec::new()
            }
        }
    }

    /// RSA private-key decryption for key transport. Same error contract.
    pub fn decrypt(&self, objid: Objid, data: &[u8]) -> Vec<u8> {
        if data.len() > MAX_OP_INPUT {
            return Vec::new();
        }
        let Some(rsa) = self.keys.get(&objid).and_then(|k| k.rsa.as_ref()) else {
            debug!(objid, "decrypt request without rsa key");
            return Vec::new();
        };
        match rsa.decrypt(Pkcs1v15Encrypt, data) {
            Ok(plain) => plain,
            Err(_) => {
                debug!(objid, "decryption failed");
                Vec::new()
            }
        }
    }

    /// Answer every queued key operation on the relay channel.
    pub fn serve(&self, chan: &mut Channel) -> Result<(), IpcError> {
        while let Some(msg) = chan.recv()? {
            match msg.hdr.typ {
                MsgType::CaPrivEnc => {
                    let op: CaKeyOp = msg.decode()?;
                    let data = self.sign(op.objid, op.scheme, &op.data);
                    chan.send(MsgType::CaResp, op.objid, &CaKeyResp { data })?;
                }
                MsgType::CaPrivDec => {
                    let op: CaKeyDec = msg.decode()?;
                    let data = self.decrypt(op.objid, &op.data);
                    chan.send(MsgType::CaResp, op.objid, &CaKeyResp { data })?;
                }
                other => {
                    return Err(IpcError::Protocol(format!(
                        "unexpected {other:?} on key channel"
                    )))
                }
            }
        }
        Ok(())
    }
}

const TOK_PARENT: u64 = 0;
const TOK_SIGNAL: u64 = 1;
const TOK_RELAY: u64 = 2;

/// CA worker main loop.
pub fn run(worker: WorkerProc, opts: &GlobalConf) -> Result<()> {
    privsep::drop_privileges(opts)?;
    privsep::ignore_sigpipe()?;

    let mut poller = Poller::new()?;
    let mut sfd = event::signal_fd(&[
        nix::sys::signal::Signal::SIGTERM,
        nix::sys::signal::Signal::SIGINT,
        nix::sys::signal::Signal::SIGHUP,
    ])?;
    let mut parent = worker.chan;
    poller.add(&parent, TOK_PARENT, true, false)?;
    poller.add(&sfd, TOK_SIGNAL, true, false)?;

    let mut ctx = WorkerCtx::new(worker.role, worker.instance);
    let mut store = CaStore::default();
    let mut relay_chan: Option<Channel> = None;
    let mut events = Vec::new();

    loop {
        poller.wait(&mut events)?;
        let round: Vec<Event> = events.clone();
        for ev in round {
            match ev {
                Event::Io { token: TOK_SIGNAL, .. } => {
                    while let Ok(Some(sig)) = sfd.read_signal() {
                        match sig.ssi_signo as i32 {
                            libc::SIGTERM | libc::SIGINT => {
                                debug!("ca worker shutting down on signal");
                                return Ok(());
                            }
                            _ => {}
                        }
                    }
                }
                Event::Io { token: TOK_PARENT, writable, .. } => {
                    if writable {
                        parent.flush()?;
                    }
                    loop {
                        let msg = match parent.recv() {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        };
                        match ctx.dispatch(&mut parent, msg) {
                            Ok(CtlEvent::Start) => {
                                // a reset that did not carry relays leaves
                                // the installed keys alone
                                if !ctx.keypairs.is_empty() {
                                    let mut keypairs = std::mem::take(&mut ctx.keypairs);
                                    store.install(&mut keypairs)?;
                                }
                            }
                            Ok(CtlEvent::Apply(_)) | Ok(CtlEvent::None) => {}
                            Ok(CtlEvent::Shutdown) => {
                                debug!("ca worker shutting down");
                                return Ok(());
                            }
                            Ok(CtlEvent::Peer(fd, _)) => {
                                relay_chan = Some(install_relay_chan(&poller, fd)?);
                            }
                            Ok(CtlEvent::Service(msg)) => {
                                warn!(?msg.hdr.typ, "unhandled message in ca worker");
                            }
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        }
                    }
                    poller.modify(&parent, TOK_PARENT, true, parent.has_pending())?;
                }
                Event::Io { token: TOK_RELAY, writable, .. } => {
                    if let Some(chan) = relay_chan.as_mut() {
                        if writable {
                            chan.flush()?;
                        }
                        if let Err(e) = store.serve(chan) {
                            privsep::fatal_ipc(worker.role, &e);
                        }
                        poller.modify(chan, TOK_RELAY, true, chan.has_pending())?;
                    }
                }
                _ => {}
            }
        }
        poller.modify(&parent, TOK_PARENT, true, parent.has_pending())?;
        if let Some(chan) = relay_chan.as_ref() {
            poller.modify(chan, TOK_RELAY, true, chan.has_pending())?;
        }
    }
}

fn install_relay_chan(poller: &Poller, fd: OwnedFd) -> Result<Channel> {
    let chan = Channel::from_fd(fd);
    chan.set_nonblocking(true)?;
    poller.add(&chan, TOK_RELAY, true, false)?;
    debug!("relay key channel connected");
    Ok(chan)
}

// --- relay side ----------------------------------------------------------

/// Blocking client for the relay's CA channel. The channel stays in
/// blocking mode; a key op is the single synchronous call in the relay.
pub struct CaClient {
    chan: Mutex<Channel>,
}

impl CaClient {
    pub fn new(fd: OwnedFd) -> Result<Arc<CaClient>> {
        let chan = Channel::from_fd(fd);
        chan.set_nonblocking(false)?;
        Ok(Arc::new(CaClient {
            chan: Mutex::new(chan),
        }))
    }

    fn roundtrip(&self, typ: MsgType, objid: Objid, payload: &[u8]) -> Result<Vec<u8>, IpcError> {
        let mut chan = self.chan.lock().expect("ca channel poisoned");
        chan.send_raw(typ, objid, payload)?;
        while chan.flush()? {}
        loop {
            match chan.recv()? {
                Some(msg) if msg.hdr.typ == MsgType::CaResp => {
                    let resp: CaKeyResp = msg.decode()?;
                    return Ok(resp.data);
                }
                Some(msg) => {
                    return Err(IpcError::Protocol(format!(
                        "unexpected {:?} on key channel",
                        msg.hdr.typ
                    )))
                }
                None => continue,
            }
        }
    }

    pub fn priv_enc(&self, objid: Objid, scheme: SignatureScheme, data: &[u8]) -> Result<Vec<u8>, IpcError> {
        let op = CaKeyOp {
            objid,
            scheme: scheme_to_wire(scheme),
            data: data.to_vec(),
        };
        self.roundtrip(MsgType::CaPrivEnc, objid, &bincode::serialize(&op)?)
    }

    pub fn priv_dec(&self, objid: Objid, data: &[u8]) -> Result<Vec<u8>, IpcError> {
        let op = CaKeyDec {
            objid,
            data: data.to_vec(),
        };
        self.roundtrip(MsgType::CaPrivDec, objid, &bincode::serialize(&op)?)
    }
}

/// The signing key a relay installs into rustls: public parameters only,
/// every signature is an RPC to the paired CA process.
#[derive(Debug)]
pub struct RemoteKey {
    objid: Objid,
    algo: KeyAlgo,
    client: Arc<CaClient>,
}

impl std::fmt::Debug for CaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaClient").finish_non_exhaustive()
    }
}

impl RemoteKey {
    pub fn new(objid: Objid, algo: KeyAlgo, client: Arc<CaClient>) -> Arc<RemoteKey> {
        Arc::new(RemoteKey {
            objid,
            algo,
            client,
        })
    }
}

impl SigningKey for RemoteKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let ours = tls::schemes_for(self.algo);
        let scheme = ours.iter().find(|s| offered.contains(s))?;
        Some(Box::new(RemoteSigner {
            objid: self.objid,
            scheme: *scheme,
            client: self.client.clone(),
        }))
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.algo {
            KeyAlgo::Rsa => SignatureAlgorithm::RSA,
            KeyAlgo::Ecdsa => SignatureAlgorithm::ECDSA,
            KeyAlgo::Ed25519 => SignatureAlgorithm::ED25519,
        }
    }
}

#[derive(Debug)]
struct RemoteSigner {
    objid: Objid,
    scheme: SignatureScheme,
    client: Arc<CaClient>,
}

impl Signer for RemoteSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        match self.client.priv_enc(self.objid, self.scheme, message) {
            Ok(sig) if !sig.is_empty() => Ok(sig),
            Ok(_) => Err(rustls::Error::General("key operation refused".into())),
            Err(e) => Err(rustls::Error::General(format!("key channel error: {e}"))),
        }
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPublicKey;

    fn test_keypair() -> (KeyPairMsg, RsaPrivateKey) {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        (
            KeyPairMsg {
                objid: 7,
                key_pem: pem.into_bytes(),
            },
            key,
        )
    }

    #[test]
    fn scheme_wire_roundtrip() {
        for scheme in [
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ] {
            assert_eq!(scheme_from_wire(scheme_to_wire(scheme)), Some(scheme));
        }
        assert_eq!(scheme_from_wire(0xffff), None);
    }

    #[test]
    fn install_zeroizes_pem_and_signs() {
        let (kp, _) = test_keypair();
        let mut keypairs = vec![kp];
        let mut store = CaStore::default();
        store.install(&mut keypairs).unwrap();
        assert!(keypairs[0].key_pem.iter().all(|&b| b == 0));
        assert_eq!(store.key_algo(7), Some(KeyAlgo::Rsa));

        let sig = store.sign(7, scheme_to_wire(SignatureScheme::RSA_PKCS1_SHA256), b"tbs");
        assert_eq!(sig.len(), 256);
    }

    #[test]
    fn error_contract_returns_empty() {
        let (kp, _) = test_keypair();
        let mut keypairs = vec![kp];
        let mut store = CaStore::default();
        store.install(&mut keypairs).unwrap();

        // unknown objid
        assert!(store
            .sign(99, scheme_to_wire(SignatureScheme::RSA_PKCS1_SHA256), b"x")
            .is_empty());
        // oversize input
        assert!(store
            .sign(7, scheme_to_wire(SignatureScheme::RSA_PKCS1_SHA256), &vec![0u8; MAX_OP_INPUT + 1])
            .is_empty());
        // scheme the key cannot serve
        assert!(store
            .sign(7, scheme_to_wire(SignatureScheme::ECDSA_NISTP256_SHA256), b"x")
            .is_empty());
        // bogus ciphertext decrypt
        assert!(store.decrypt(7, &[0u8; 256]).is_empty());
    }

    #[test]
    fn decrypt_roundtrip() {
        let (kp, key) = test_keypair();
        let mut keypairs = vec![kp];
        let mut store = CaStore::default();
        store.install(&mut keypairs).unwrap();

        let public = RsaPublicKey::from(&key);
        let ciphertext = public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, b"premaster")
            .unwrap();
        assert_eq!(store.decrypt(7, &ciphertext), b"premaster");
    }

    #[test]
    fn remote_key_signs_through_channel() {
        let (kp, _) = test_keypair();
        let mut keypairs = vec![kp];
        let mut store = CaStore::default();
        store.install(&mut keypairs).unwrap();

        let (ca_end, relay_end) = Channel::pair().unwrap();
        ca_end.set_nonblocking(false).unwrap();
        let server = std::thread::spawn(move || {
            let mut chan = ca_end;
            // serve exactly one op, blocking
            let msg = chan.recv().unwrap().unwrap();
            assert_eq!(msg.hdr.typ, MsgType::CaPrivEnc);
            let op: CaKeyOp = msg.decode().unwrap();
            let data = store.sign(op.objid, op.scheme, &op.data);
            chan.send(MsgType::CaResp, op.objid, &CaKeyResp { data })
                .unwrap();
        });

        let client = CaClient::new(relay_end.into_fd()).unwrap();
        let key = RemoteKey::new(7, KeyAlgo::Rsa, client);
        let signer = key
            .choose_scheme(&[SignatureScheme::RSA_PSS_SHA256])
            .unwrap();
        let sig = signer.sign(b"transcript").unwrap();
        assert_eq!(sig.len(), 256);
        server.join().unwrap();
    }

    #[test]
    fn remote_key_rejects_unknown_schemes() {
        let (_, relay_end) = Channel::pair().unwrap();
        let client = CaClient::new(relay_end.into_fd()).unwrap();
        let key = RemoteKey::new(1, KeyAlgo::Ecdsa, client);
        assert!(key.choose_scheme(&[SignatureScheme::RSA_PKCS1_SHA256]).is_none());
    }
}
