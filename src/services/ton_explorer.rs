//! TON chain explorer access (Toncenter v3).
//!
//! The shop wallet receives two kinds of payments:
//! - native TON transfers, whose text comment Toncenter already decodes
//! - USDT jetton transfers, whose comment lives in the `forward_payload` cell
//!   (a base64 bag-of-cells) and is decoded here when Toncenter does not

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppError;

/// Asset of an incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Ton,
    Usdt,
}

/// Incoming transfer to the shop wallet, normalized across TON and jettons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransfer {
    pub tx_hash: String,
    pub asset: Asset,
    /// Smallest unit: nanotons or micro-USDT
    pub amount: i64,
    pub comment: Option<String>,
    pub utime: i64,
}

impl IncomingTransfer {
    /// Provider transaction id used for idempotent settlement.
    pub fn evidence(&self) -> String {
        format!("ton:{}", self.tx_hash)
    }
}

/// One page of a newest-first listing, bounded below by `since_utime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub since_utime: i64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Default)]
pub struct TransferPage {
    pub transfers: Vec<IncomingTransfer>,
    /// The explorer returned a full page, so older entries may follow
    pub has_more: bool,
}

#[async_trait]
pub trait ChainExplorer: Send + Sync {
    /// Incoming TON transfers to `wallet`, newest first.
    async fn incoming_ton(&self, wallet: &str, page: PageRequest)
    -> Result<TransferPage, AppError>;

    /// Incoming transfers of `jetton_master` to `wallet`, newest first.
    async fn incoming_jetton(
        &self,
        wallet: &str,
        jetton_master: &str,
        page: PageRequest,
    ) -> Result<TransferPage, AppError>;
}

#[derive(Clone)]
pub struct ToncenterClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TransactionsResponse {
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct RawTransaction {
    hash: String,
    now: i64,
    in_msg: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    /// `None` for external messages
    source: Option<String>,
    value: Option<String>,
    message_content: Option<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    decoded: Option<DecodedContent>,
}

#[derive(Deserialize)]
struct DecodedContent {
    #[serde(rename = "type")]
    kind: Option<String>,
    comment: Option<String>,
}

#[derive(Deserialize)]
struct JettonTransfersResponse {
    jetton_transfers: Vec<RawJettonTransfer>,
}

#[derive(Deserialize)]
struct RawJettonTransfer {
    transaction_hash: String,
    transaction_now: i64,
    amount: String,
    #[serde(default)]
    transaction_aborted: bool,
    forward_payload: Option<String>,
    decoded_forward_payload: Option<DecodedContent>,
}

impl ToncenterClient {
    pub fn new(api_url: &str, api_key: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let mut request = self
            .client
            .get(format!("{}/{}", self.api_url, path))
            .query(query);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Toncenter {path} failed with {status}: {text}"
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ChainExplorer for ToncenterClient {
    async fn incoming_ton(
        &self,
        wallet: &str,
        page: PageRequest,
    ) -> Result<TransferPage, AppError> {
        let response: TransactionsResponse = self
            .get(
                "transactions",
                &[
                    ("account", wallet.to_string()),
                    ("start_utime", page.since_utime.to_string()),
                    ("limit", page.limit.to_string()),
                    ("offset", page.offset.to_string()),
                    ("sort", "desc".to_string()),
                ],
            )
            .await?;

        let has_more = response.transactions.len() >= page.limit as usize;
        Ok(TransferPage {
            transfers: response
                .transactions
                .into_iter()
                .filter_map(normalize_ton)
                .collect(),
            has_more,
        })
    }

    async fn incoming_jetton(
        &self,
        wallet: &str,
        jetton_master: &str,
        page: PageRequest,
    ) -> Result<TransferPage, AppError> {
        let response: JettonTransfersResponse = self
            .get(
                "jetton/transfers",
                &[
                    ("owner_address", wallet.to_string()),
                    ("jetton_master", jetton_master.to_string()),
                    ("direction", "in".to_string()),
                    ("start_utime", page.since_utime.to_string()),
                    ("limit", page.limit.to_string()),
                    ("offset", page.offset.to_string()),
                    ("sort", "desc".to_string()),
                ],
            )
            .await?;

        let has_more = response.jetton_transfers.len() >= page.limit as usize;
        Ok(TransferPage {
            transfers: response
                .jetton_transfers
                .into_iter()
                .filter_map(normalize_jetton)
                .collect(),
            has_more,
        })
    }
}

fn normalize_ton(tx: RawTransaction) -> Option<IncomingTransfer> {
    let msg = tx.in_msg?;
    // External messages carry no value and are our own wallet's outgoing ops.
    msg.source.as_ref()?;
    let amount = msg.value.as_deref()?.parse::<i64>().ok()?;
    if amount <= 0 {
        return None;
    }
    let comment = msg
        .message_content
        .and_then(|c| c.decoded)
        .filter(|d| d.kind.as_deref() == Some("text_comment"))
        .and_then(|d| d.comment);

    Some(IncomingTransfer {
        tx_hash: tx.hash,
        asset: Asset::Ton,
        amount,
        comment,
        utime: tx.now,
    })
}

fn normalize_jetton(transfer: RawJettonTransfer) -> Option<IncomingTransfer> {
    if transfer.transaction_aborted {
        return None;
    }
    let amount = transfer.amount.parse::<i64>().ok()?;
    let comment = transfer
        .decoded_forward_payload
        .and_then(|d| d.comment)
        .or_else(|| {
            transfer
                .forward_payload
                .as_deref()
                .and_then(decode_text_comment)
        });

    Some(IncomingTransfer {
        tx_hash: transfer.transaction_hash,
        asset: Asset::Usdt,
        amount,
        comment,
        utime: transfer.transaction_now,
    })
}

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

/// Comments longer than this are not payment memos.
const MAX_COMMENT_BYTES: usize = 1024;

/// One parsed cell: data bytes (complete bytes only) and child indices.
struct Cell {
    data: Vec<u8>,
    refs: Vec<usize>,
}

/// Decode a text comment (`op = 0` followed by UTF-8, possibly snake-encoded
/// across child cells) from a base64 bag-of-cells.
pub fn decode_text_comment(boc_base64: &str) -> Option<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(boc_base64.trim())
        .ok()?;
    let (cells, root) = parse_boc(&bytes)?;

    let mut payload = Vec::new();
    let mut current = cells.get(root)?;
    loop {
        payload.extend_from_slice(&current.data);
        if payload.len() > MAX_COMMENT_BYTES {
            return None;
        }
        match current.refs.first() {
            Some(&next) => current = cells.get(next)?,
            None => break,
        }
    }

    if payload.len() < 4 || payload[..4] != [0, 0, 0, 0] {
        return None;
    }
    String::from_utf8(payload[4..].to_vec()).ok()
}

fn parse_boc(bytes: &[u8]) -> Option<(Vec<Cell>, usize)> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.take(4)? != BOC_MAGIC {
        return None;
    }
    let flags = reader.byte()?;
    let has_index = flags & 0x80 != 0;
    let ref_size = usize::from(flags & 0x07);
    let offset_size = usize::from(reader.byte()?);
    if ref_size == 0 || ref_size > 4 || offset_size == 0 || offset_size > 8 {
        return None;
    }

    let cell_count = reader.uint(ref_size)?;
    let root_count = reader.uint(ref_size)?;
    let _absent = reader.uint(ref_size)?;
    let _total_size = reader.uint(offset_size)?;
    // Every cell takes at least its two descriptor bytes.
    if root_count == 0 || cell_count == 0 || cell_count.checked_mul(2)? > bytes.len() {
        return None;
    }
    let root = reader.uint(ref_size)?;
    if root >= cell_count {
        return None;
    }
    reader.take(ref_size * (root_count - 1))?;
    if has_index {
        reader.take(offset_size * cell_count)?;
    }

    let mut cells = Vec::with_capacity(cell_count);
    for index in 0..cell_count {
        let d1 = reader.byte()?;
        let d2 = reader.byte()?;
        // Cells serialized with hashes are not produced for comment payloads.
        if d1 & 0x10 != 0 {
            return None;
        }
        let ref_count = usize::from(d1 & 0x07);
        let data_len = usize::from(d2).div_ceil(2);
        let mut data = reader.take(data_len)?.to_vec();
        if d2 % 2 == 1 {
            // Last byte is partially filled; a text comment never needs it.
            data.pop();
        }
        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            // Children always come after their parent; this also rules out cycles.
            let child = reader.uint(ref_size)?;
            if child <= index || child >= cell_count {
                return None;
            }
            refs.push(child);
        }
        cells.push(Cell { data, refs });
    }

    Some((cells, root))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn uint(&mut self, size: usize) -> Option<usize> {
        Some(
            self.take(size)?
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | usize::from(*b)),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Explorer returning canned transfers; records how often it was asked.
    #[derive(Default)]
    pub(crate) struct FakeExplorer {
        pub ton: Vec<IncomingTransfer>,
        pub jetton: Vec<IncomingTransfer>,
        pub requests: Mutex<u32>,
    }

    impl FakeExplorer {
        fn page(&self, transfers: &[IncomingTransfer], page: PageRequest) -> TransferPage {
            *self.requests.lock().unwrap() += 1;
            let mut newest_first: Vec<_> = transfers
                .iter()
                .filter(|t| t.utime >= page.since_utime)
                .cloned()
                .collect();
            newest_first.sort_by_key(|t| std::cmp::Reverse(t.utime));

            let start = page.offset as usize;
            let end = start + page.limit as usize;
            TransferPage {
                has_more: newest_first.len() > end,
                transfers: newest_first
                    .into_iter()
                    .skip(start)
                    .take(page.limit as usize)
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ChainExplorer for FakeExplorer {
        async fn incoming_ton(
            &self,
            _wallet: &str,
            page: PageRequest,
        ) -> Result<TransferPage, AppError> {
            Ok(self.page(&self.ton, page))
        }

        async fn incoming_jetton(
            &self,
            _wallet: &str,
            _jetton_master: &str,
            page: PageRequest,
        ) -> Result<TransferPage, AppError> {
            Ok(self.page(&self.jetton, page))
        }
    }

    /// Single-cell BOC (no index, 1-byte refs, 1-byte offsets) holding `data`.
    fn single_cell_boc(data: &[u8]) -> String {
        let mut boc = BOC_MAGIC.to_vec();
        boc.push(0x01); // no index, ref size 1
        boc.push(0x01); // offset size 1
        boc.extend_from_slice(&[1, 1, 0]); // cells, roots, absent
        boc.push((2 + data.len()) as u8); // total cells size
        boc.push(0); // root index
        boc.push(0); // d1: no refs
        boc.push((data.len() * 2) as u8); // d2: full bytes
        boc.extend_from_slice(data);
        base64::engine::general_purpose::STANDARD.encode(boc)
    }

    #[test]
    fn decodes_single_cell_text_comment() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"sub-ab12cd34ef");
        assert_eq!(
            decode_text_comment(&single_cell_boc(&data)).as_deref(),
            Some("sub-ab12cd34ef")
        );
    }

    #[test]
    fn oversized_cell_count_is_rejected_before_allocating() {
        let mut boc = BOC_MAGIC.to_vec();
        boc.push(0x04); // no index, ref size 4
        boc.push(0x01);
        boc.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]); // cells
        boc.extend_from_slice(&[0, 0, 0, 1]); // roots
        boc.extend_from_slice(&[0, 0, 0, 0]); // absent
        boc.push(0); // total cells size
        boc.extend_from_slice(&[0, 0, 0, 0]); // root index
        let encoded = base64::engine::general_purpose::STANDARD.encode(boc);

        assert_eq!(decode_text_comment(&encoded), None);
    }

    #[test]
    fn cell_referring_back_to_itself_is_rejected() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"loop");
        let mut boc = BOC_MAGIC.to_vec();
        boc.push(0x01);
        boc.push(0x01);
        boc.extend_from_slice(&[1, 1, 0]);
        boc.push((3 + data.len()) as u8);
        boc.push(0);
        boc.push(1); // d1: one ref
        boc.push((data.len() * 2) as u8);
        boc.extend_from_slice(&data);
        boc.push(0); // ref to cell 0, itself
        let encoded = base64::engine::general_purpose::STANDARD.encode(boc);

        assert_eq!(decode_text_comment(&encoded), None);
    }

    #[test]
    fn snake_encoded_comment_follows_child_cells() {
        let mut root = vec![0, 0, 0, 0];
        root.extend_from_slice(b"sub-ab12");
        let tail = b"cd34ef";
        let mut boc = BOC_MAGIC.to_vec();
        boc.push(0x01);
        boc.push(0x01);
        boc.extend_from_slice(&[2, 1, 0]);
        boc.push((2 + root.len() + 1 + 2 + tail.len()) as u8);
        boc.push(0);
        boc.push(1);
        boc.push((root.len() * 2) as u8);
        boc.extend_from_slice(&root);
        boc.push(1); // ref to cell 1
        boc.push(0);
        boc.push((tail.len() * 2) as u8);
        boc.extend_from_slice(tail);
        let encoded = base64::engine::general_purpose::STANDARD.encode(boc);

        assert_eq!(decode_text_comment(&encoded).as_deref(), Some("sub-ab12cd34ef"));
    }

    #[test]
    fn non_comment_payloads_are_ignored() {
        let data = [0x0f, 0x8a, 0x7e, 0xa5, 1, 2, 3];
        assert_eq!(decode_text_comment(&single_cell_boc(&data)), None);
        assert_eq!(decode_text_comment("not base64!"), None);
        assert_eq!(decode_text_comment(""), None);
    }

    #[test]
    fn ton_transactions_keep_only_valued_internal_messages() {
        let raw: TransactionsResponse = serde_json::from_value(serde_json::json!({
            "transactions": [
                {
                    "hash": "h1",
                    "now": 1700000000,
                    "in_msg": {
                        "source": "0:AAA",
                        "value": "2500000000",
                        "message_content": {
                            "decoded": { "type": "text_comment", "comment": "sub-1" }
                        }
                    }
                },
                {
                    "hash": "h2",
                    "now": 1700000001,
                    "in_msg": { "source": null, "value": null, "message_content": null }
                }
            ]
        }))
        .unwrap();

        let transfers: Vec<_> = raw.transactions.into_iter().filter_map(normalize_ton).collect();
        assert_eq!(
            transfers,
            vec![IncomingTransfer {
                tx_hash: "h1".to_string(),
                asset: Asset::Ton,
                amount: 2_500_000_000,
                comment: Some("sub-1".to_string()),
                utime: 1_700_000_000,
            }]
        );
    }

    #[test]
    fn jetton_transfers_skip_aborted_and_decode_payload() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"sub-2");
        let raw: JettonTransfersResponse = serde_json::from_value(serde_json::json!({
            "jetton_transfers": [
                {
                    "transaction_hash": "j1",
                    "transaction_now": 1700000000,
                    "amount": "9000000",
                    "transaction_aborted": false,
                    "forward_payload": single_cell_boc(&data),
                    "decoded_forward_payload": null
                },
                {
                    "transaction_hash": "j2",
                    "transaction_now": 1700000000,
                    "amount": "9000000",
                    "transaction_aborted": true,
                    "forward_payload": null,
                    "decoded_forward_payload": null
                }
            ]
        }))
        .unwrap();

        let transfers: Vec<_> = raw
            .jetton_transfers
            .into_iter()
            .filter_map(normalize_jetton)
            .collect();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].comment.as_deref(), Some("sub-2"));
        assert_eq!(transfers[0].evidence(), "ton:j1");
    }
}
