//! Parsing of the collection hierarchy description (`90_rootprops.xml`).
//!
//! The document is a WebDAV multistatus: one `response` per declared path,
//! carrying the resource type, the ACL and any dead properties.

use roxmltree::{Document, Node};

use crate::error::{ErrorKind, InstallError, InstallResult};
use crate::messages;
use crate::storage::ResourceKind;

/// Scheme every href must use; `localbox:` alone denotes the box root.
pub const BOX_SCHEME: &str = "localbox:";

const DAV_NS: &str = "DAV:";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Properties that are derived by the store and never copied.
const IGNORED_PROPS: [&str; 3] = ["creationdate", "getlastmodified", "resourcetype"];

/// An ACL element serialized without its `xml:base`, which is re-attached
/// when the role base is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclFragment {
    pub base: Option<String>,
    xml: String,
    tag_end: usize,
}

impl AclFragment {
    pub fn render(&self, base: Option<&str>) -> String {
        match base {
            Some(base) => format!(
                "{} xml:base=\"{}\"{}",
                &self.xml[..self.tag_end],
                escape(base, true),
                &self.xml[self.tag_end..]
            ),
            None => self.xml.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionDescriptor {
    pub path: String,
    pub kind: ResourceKind,
    pub acl: Option<AclFragment>,
    pub properties: Vec<String>,
    pub content_type: Option<String>,
}

/// Parse every `response` of the document, in document order.
pub fn parse(xml: &str, entry: &str) -> InstallResult<Vec<CollectionDescriptor>> {
    let doc = Document::parse(xml).map_err(|e| InstallError::format(entry, e.to_string()))?;
    let root = doc.root_element();
    if !is_dav(root, "multistatus") {
        return Err(InstallError::format(entry, "root element must be DAV:multistatus"));
    }
    root.children()
        .filter(|n| is_dav(*n, "response"))
        .map(|response| parse_response(response, entry))
        .collect()
}

fn parse_response(response: Node, entry: &str) -> InstallResult<CollectionDescriptor> {
    let hrefs: Vec<Node> = response.children().filter(|n| is_dav(*n, "href")).collect();
    if hrefs.len() != 1 {
        return Err(InstallError::new(
            ErrorKind::Format,
            messages::HREF_COUNT,
            entry,
            format!("{} href elements", hrefs.len()),
        ));
    }
    let href = hrefs[0].text().unwrap_or("").trim();
    if href.is_empty() {
        return Err(InstallError::new(ErrorKind::Format, messages::HREF_EMPTY, entry, "href"));
    }
    if !href.starts_with(BOX_SCHEME) {
        return Err(InstallError::new(ErrorKind::Format, messages::HREF_SCHEME, entry, href));
    }

    let props: Vec<Node> = response
        .children()
        .filter(|n| is_dav(*n, "propstat"))
        .flat_map(|propstat| propstat.children().filter(|n| is_dav(*n, "prop")))
        .flat_map(|prop| prop.children().filter(Node::is_element))
        .collect();

    let kind = resource_kind(&props, href, entry)?;
    let path = normalize_href(href, kind)
        .ok_or_else(|| InstallError::new(ErrorKind::Format, messages::HREF_SCHEME, entry, href))?;

    let mut descriptor = CollectionDescriptor {
        path,
        kind,
        acl: None,
        properties: Vec::new(),
        content_type: None,
    };
    for prop in props {
        let name = prop.tag_name().name();
        if is_dav(prop, "getcontenttype") {
            descriptor.content_type = prop.text().map(|t| t.trim().to_string());
        } else if name == "acl" {
            if prop.tag_name().namespace() != Some(DAV_NS) {
                return Err(InstallError::new(
                    ErrorKind::Format,
                    messages::ACL_NAMESPACE,
                    entry,
                    href,
                ));
            }
            descriptor.acl = Some(acl_fragment(prop));
        } else if is_dav(prop, name) && IGNORED_PROPS.contains(&name) {
            continue;
        } else {
            let mut xml = String::new();
            write_element(prop, &mut xml, true, false);
            descriptor.properties.push(xml);
        }
    }
    Ok(descriptor)
}

fn resource_kind(props: &[Node], href: &str, entry: &str) -> InstallResult<ResourceKind> {
    let Some(resourcetype) = props.iter().find(|p| is_dav(**p, "resourcetype")) else {
        return Ok(ResourceKind::File);
    };
    let markers: Vec<Node> = resourcetype.children().filter(Node::is_element).collect();
    if !markers.iter().any(|m| is_dav(*m, "collection")) {
        return Ok(ResourceKind::File);
    }
    let mut kind = ResourceKind::WebDav;
    for marker in markers.iter().filter(|m| !is_dav(**m, "collection")) {
        let next = match marker.tag_name().name() {
            "odata" => ResourceKind::StructuredData,
            "service" => ResourceKind::Service,
            other => {
                return Err(InstallError::new(
                    ErrorKind::Format,
                    messages::UNKNOWN_RESOURCE_TYPE,
                    entry,
                    format!("{} ({})", other, href),
                ))
            }
        };
        if kind != ResourceKind::WebDav && kind != next {
            return Err(InstallError::new(
                ErrorKind::Format,
                messages::UNKNOWN_RESOURCE_TYPE,
                entry,
                href,
            ));
        }
        kind = next;
    }
    Ok(kind)
}

/// Path relative to the box root; `None` if the href has no path form.
pub fn normalize_href(href: &str, kind: ResourceKind) -> Option<String> {
    let mut rest = href.strip_prefix(BOX_SCHEME)?;
    if kind.is_collection() {
        rest = rest.trim_end_matches('/');
    }
    if rest.is_empty() || rest == "/" {
        return Some("/".to_string());
    }
    if !rest.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

fn is_dav(node: Node, name: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == name
        && node.tag_name().namespace() == Some(DAV_NS)
}

fn acl_fragment(acl: Node) -> AclFragment {
    let base = acl
        .attributes()
        .find(|a| a.namespace() == Some(XML_NS) && a.name() == "base")
        .map(|a| a.value().to_string());
    let mut xml = String::new();
    write_element(acl, &mut xml, true, true);
    let tag_end = 1 + qualified_element(acl).len();
    AclFragment { base, xml, tag_end }
}

fn qualified_element(node: Node) -> String {
    let local = node.tag_name().name();
    match node.tag_name().namespace() {
        Some(uri) => match node.lookup_prefix(uri) {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}", prefix, local),
            _ => local.to_string(),
        },
        None => local.to_string(),
    }
}

/// Serialize an element subtree. The fragment root redeclares every
/// namespace in scope so it stands alone.
fn write_element(node: Node, out: &mut String, root: bool, skip_base: bool) {
    let name = qualified_element(node);
    out.push('<');
    out.push_str(&name);
    if root {
        for ns in node.namespaces() {
            match ns.name() {
                Some("xml") => {}
                Some(prefix) => out.push_str(&format!(" xmlns:{}=\"{}\"", prefix, escape(ns.uri(), true))),
                None => out.push_str(&format!(" xmlns=\"{}\"", escape(ns.uri(), true))),
            }
        }
    }
    for attr in node.attributes() {
        let qualified = match attr.namespace() {
            Some(XML_NS) if skip_base && attr.name() == "base" => continue,
            Some(XML_NS) => format!("xml:{}", attr.name()),
            Some(uri) => match node.lookup_prefix(uri) {
                Some(prefix) => format!("{}:{}", prefix, attr.name()),
                None => attr.name().to_string(),
            },
            None => attr.name().to_string(),
        };
        out.push_str(&format!(" {}=\"{}\"", qualified, escape(attr.value(), true)));
    }

    let children: Vec<Node> = node
        .children()
        .filter(|c| c.is_element() || c.is_text())
        .collect();
    if children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in children {
        if child.is_element() {
            write_element(child, out, false, false);
        } else if let Some(text) = child.text() {
            out.push_str(&escape(text, false));
        }
    }
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

fn escape(value: &str, attribute: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' if attribute => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
