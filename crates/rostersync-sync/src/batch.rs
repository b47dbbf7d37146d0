//! Wire batch builder
//!
//! Turns a map of contact identities to desired list bits into `<ml>`
//! documents ready to be framed as `ADL`/`RML` commands:
//!
//! ```text
//! <ml l="1">
//!   <d n="example.com">
//!     <c n="alice" t="1"><s l="3" n="IM"/></c>
//!   </d>
//!   <t><c n="+15551234" t="4"><s l="1" n="IM"/></c></t>
//! </ml>
//! ```
//!
//! Entries are grouped by lowercased domain; telephone and remote-network
//! identities have no domain and go into the `<t>` and `<n>` buckets, after
//! every domain. A document is closed before appending a contact node
//! would take it past [`MAX_PAYLOAD_CHARS`].
//!
//! The builder is pure: the same input always yields byte-identical output.

use std::collections::BTreeMap;

use rostersync_core::domain::{ClientType, ContactHash, RoleLists};

/// Size threshold of one serialized document
pub const MAX_PAYLOAD_CHARS: usize = 7300;

/// Level sent on the presence service for hidden contacts
const PRESENCE_HIDE_LEVEL: u32 = 4;

/// One output document and the contacts it announces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBatch {
    /// Serialized `<ml>` document
    pub payload: String,
    /// Contacts carried by the document, in document order
    pub contacts: Vec<ContactHash>,
}

/// Grouping node of a contact; the derived order is the document order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    Domain(String),
    Telephone,
    RemoteNetwork,
}

impl Bucket {
    fn of(hash: &ContactHash) -> Self {
        match hash.client_type() {
            ClientType::Telephone => Bucket::Telephone,
            ClientType::RemoteNetwork => Bucket::RemoteNetwork,
            _ => Bucket::Domain(hash.domain().unwrap_or_default().to_lowercase()),
        }
    }

    fn open_tag(&self) -> String {
        match self {
            Bucket::Domain(domain) => format!("<d n=\"{}\">", escape(domain)),
            Bucket::Telephone => "<t>".to_string(),
            Bucket::RemoteNetwork => "<n>".to_string(),
        }
    }

    fn close_tag(&self) -> &'static str {
        match self {
            Bucket::Domain(_) => "</d>",
            Bucket::Telephone => "</t>",
            Bucket::RemoteNetwork => "</n>",
        }
    }
}

/// Builds the payloads for `entries`
///
/// Always returns at least one document; an empty input (or one where no
/// entry carries an announceable bit) yields `<ml/>` or `<ml l="1"/>`.
pub fn build_batches(entries: &BTreeMap<ContactHash, RoleLists>, initial: bool) -> Vec<String> {
    build_wire_batches(entries, initial)
        .into_iter()
        .map(|batch| batch.payload)
        .collect()
}

/// Builds the documents for `entries`, keeping track of the contacts in each
pub fn build_wire_batches(
    entries: &BTreeMap<ContactHash, RoleLists>,
    initial: bool,
) -> Vec<WireBatch> {
    let mut sorted: Vec<(Bucket, &ContactHash, RoleLists)> = entries
        .iter()
        .map(|(hash, lists)| (Bucket::of(hash), hash, *lists))
        .collect();
    // Stable: entries sharing a bucket keep the map order
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let root_open = if initial { "<ml l=\"1\">" } else { "<ml>" };
    let root_close = "</ml>";

    let mut batches = Vec::new();
    let mut current = DocumentWriter::new(root_open);

    for (bucket, hash, lists) in sorted {
        let Some(node) = contact_node(hash, lists) else {
            tracing::trace!(contact = %hash, "Skipping entry without announceable lists");
            continue;
        };

        let switching = current.group.as_ref() != Some(&bucket);
        let mut projected =
            current.text.len() + node.len() + bucket.close_tag().len() + root_close.len();
        if switching {
            projected += bucket.open_tag().len();
            if let Some(open) = &current.group {
                projected += open.close_tag().len();
            }
        }

        if !current.contacts.is_empty() && projected > MAX_PAYLOAD_CHARS {
            batches.push(current.finish(root_close));
            current = DocumentWriter::new(root_open);
        }

        current.enter(&bucket);
        current.text.push_str(&node);
        current.contacts.push(hash.clone());
    }

    if current.contacts.is_empty() {
        if batches.is_empty() {
            let empty = if initial { "<ml l=\"1\"/>" } else { "<ml/>" };
            batches.push(WireBatch {
                payload: empty.to_string(),
                contacts: Vec::new(),
            });
        }
    } else {
        batches.push(current.finish(root_close));
    }

    batches
}

/// In-progress document
struct DocumentWriter {
    text: String,
    group: Option<Bucket>,
    contacts: Vec<ContactHash>,
}

impl DocumentWriter {
    fn new(root_open: &str) -> Self {
        Self {
            text: root_open.to_string(),
            group: None,
            contacts: Vec::new(),
        }
    }

    /// Opens `bucket`, closing the previous grouping node if it differs
    fn enter(&mut self, bucket: &Bucket) {
        if self.group.as_ref() == Some(bucket) {
            return;
        }
        if let Some(open) = self.group.take() {
            self.text.push_str(open.close_tag());
        }
        self.text.push_str(&bucket.open_tag());
        self.group = Some(bucket.clone());
    }

    fn finish(mut self, root_close: &str) -> WireBatch {
        if let Some(open) = self.group.take() {
            self.text.push_str(open.close_tag());
        }
        self.text.push_str(root_close);
        WireBatch {
            payload: self.text,
            contacts: self.contacts,
        }
    }
}

/// Serializes one `<c>` node, or `None` when no service level is set
fn contact_node(hash: &ContactHash, lists: RoleLists) -> Option<String> {
    let im_level = (lists & (RoleLists::FORWARD | RoleLists::ALLOW | RoleLists::BLOCK)).bits();
    let hidden = lists.contains(RoleLists::HIDE);
    if im_level == 0 && !hidden {
        return None;
    }

    let name = match hash.client_type() {
        ClientType::Telephone | ClientType::RemoteNetwork => hash.account(),
        _ => hash.local_part(),
    };

    let mut node = format!(
        "<c n=\"{}\" t=\"{}\">",
        escape(name),
        hash.client_type().code()
    );
    if im_level != 0 {
        node.push_str(&format!("<s l=\"{im_level}\" n=\"IM\"/>"));
    }
    if hidden {
        node.push_str(&format!("<s l=\"{PRESENCE_HIDE_LEVEL}\" n=\"PE\"/>"));
    }
    node.push_str("</c>");
    Some(node)
}

/// Escapes an attribute value
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
