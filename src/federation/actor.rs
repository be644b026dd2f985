//! Local actor identity
//!
//! Every IRI is computed for the host the request arrived on, so the same
//! blog is reachable as an actor on the canonical host and on every
//! alternate host.

use serde_json::json;

use crate::config::{AppConfig, normalize_host};

/// `application/activity+json`
pub const ACTIVITY_JSON: &str = "application/activity+json";
/// Content type with the ActivityStreams profile, as Mastodon sends it
pub const LD_JSON: &str = "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
/// Public addressing collection
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Whether an `Accept` header asks for an ActivityStreams representation
pub fn wants_activity_json(accept: &str) -> bool {
    let accept = accept.to_ascii_lowercase();
    accept.contains("application/activity+json") || accept.contains("application/ld+json")
}

/// The IRIs of one blog on one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlogIris {
    pub blog: String,
    pub host: String,
    pub actor: String,
    pub inbox: String,
    pub followers: String,
    pub outbox: String,
}

impl BlogIris {
    /// IRIs of `blog` on `host`; `None` for an unknown blog
    pub fn new(config: &AppConfig, blog: &str, host: &str) -> Option<Self> {
        let blog_config = config.blog(blog)?;
        let host = normalize_host(host);
        let base = config.server.address_for_host(&host);
        let actor = if blog_config.path == "/" {
            format!("{}/", base)
        } else {
            format!("{}{}", base, blog_config.path.trim_end_matches('/'))
        };

        Some(Self {
            blog: blog.to_string(),
            inbox: format!("{}/activitypub/inbox/{}", base, blog),
            followers: format!("{}/activitypub/followers/{}", base, blog),
            outbox: format!("{}/activitypub/outbox/{}", base, blog),
            actor,
            host,
        })
    }

    /// IRIs on the canonical host
    pub fn canonical(config: &AppConfig, blog: &str) -> Option<Self> {
        Self::new(config, blog, &config.server.canonical_host())
    }

    pub fn key_id(&self) -> String {
        key_id_for(&self.actor)
    }
}

/// keyId advertised for an actor IRI
pub fn key_id_for(actor: &str) -> String {
    format!("{}#main-key", actor)
}

fn same_iri(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Whether `iri` names `blog` on any local host
pub fn is_blog_iri(config: &AppConfig, blog: &str, iri: &str) -> bool {
    config
        .server
        .local_hosts()
        .iter()
        .filter_map(|host| BlogIris::new(config, blog, host))
        .any(|iris| same_iri(&iris.actor, iri))
}

/// Find the local blog and host an actor IRI belongs to
pub fn find_local_actor(config: &AppConfig, iri: &str) -> Option<BlogIris> {
    let hosts = config.server.local_hosts();
    config.blogs.keys().find_map(|blog| {
        hosts
            .iter()
            .filter_map(|host| BlogIris::new(config, blog, host))
            .find(|iris| same_iri(&iris.actor, iri))
    })
}

/// Whether a URL points at this deployment (canonical, alternate or short host)
pub fn is_local_url(config: &AppConfig, url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", normalize_host(host), port),
        None => normalize_host(host),
    };
    config.server.local_hosts().contains(&authority)
}

/// `alsoKnownAs` of a blog as served on `host`
pub fn also_known_as(config: &AppConfig, iris: &BlogIris) -> Vec<String> {
    let mut aliases: Vec<String> = config.activitypub.also_known_as.clone();

    let canonical = config.server.canonical_host();
    if iris.host == canonical {
        for alternate in config.server.alternate_hosts() {
            if let Some(alt) = BlogIris::new(config, &iris.blog, &alternate) {
                aliases.push(alt.actor);
            }
        }
    } else if let Some(canonical) = BlogIris::new(config, &iris.blog, &canonical) {
        aliases.push(canonical.actor);
    }

    let mut seen = std::collections::HashSet::new();
    aliases.retain(|alias| !same_iri(alias, &iris.actor) && seen.insert(alias.clone()));
    aliases
}

/// Values that change an actor document besides configuration
#[derive(Debug, Clone, Default)]
pub struct ActorState<'a> {
    pub public_key_pem: &'a str,
    /// Stored `movedTo` of the blog, if any
    pub moved_to: Option<&'a str>,
}

/// JSON-LD actor document of a blog on a host
pub fn actor_document(config: &AppConfig, iris: &BlogIris, state: &ActorState<'_>) -> serde_json::Value {
    let blog = config.blog(&iris.blog);
    let title = blog.map(|b| b.title.as_str()).unwrap_or(iris.blog.as_str());
    let description = blog.map(|b| b.description.as_str()).unwrap_or_default();

    let mut document = json!({
        "@context": [
            AS_CONTEXT,
            SECURITY_CONTEXT,
            {
                "alsoKnownAs": { "@id": "as:alsoKnownAs", "@type": "@id" },
                "movedTo": { "@id": "as:movedTo", "@type": "@id" },
                "schema": "http://schema.org#",
                "PropertyValue": "schema:PropertyValue",
                "value": "schema:value",
                "discoverable": "toot:discoverable",
                "toot": "http://joinmastodon.org/ns#"
            }
        ],
        "id": iris.actor,
        "type": "Person",
        "preferredUsername": iris.blog,
        "name": title,
        "summary": description,
        "url": iris.actor,
        "inbox": iris.inbox,
        "outbox": iris.outbox,
        "followers": iris.followers,
        "discoverable": true,
        "publicKey": {
            "id": iris.key_id(),
            "owner": iris.actor,
            "publicKeyPem": state.public_key_pem,
        },
        "alsoKnownAs": also_known_as(config, iris),
    });

    let Some(object) = document.as_object_mut() else {
        return document;
    };

    if let Some(icon) = blog.and_then(|b| b.icon.as_deref()) {
        object.insert(
            "icon".to_string(),
            json!({ "type": "Image", "url": icon }),
        );
    }

    let attachments: Vec<serde_json::Value> = config
        .activitypub
        .attachments
        .iter()
        .map(|link| {
            let escaped = html_escape::encode_double_quoted_attribute(link);
            let label = html_escape::encode_text(
                link.trim_start_matches("https://").trim_start_matches("http://"),
            );
            json!({
                "type": "PropertyValue",
                "name": "Link",
                "value": format!(
                    "<a href=\"{}\" rel=\"me nofollow noopener noreferrer\" target=\"_blank\">{}</a>",
                    escaped, label
                ),
            })
        })
        .collect();
    if !attachments.is_empty() {
        object.insert("attachment".to_string(), json!(attachments));
    }

    if let Some(moved_to) = state.moved_to {
        if !same_iri(moved_to, &iris.actor) {
            object.insert("movedTo".to_string(), json!(moved_to));
        }
    }

    document
}

/// OrderedCollection of follower IRIs
pub fn followers_collection(iris: &BlogIris, followers: &[String]) -> serde_json::Value {
    json!({
        "@context": AS_CONTEXT,
        "id": iris.followers,
        "type": "OrderedCollection",
        "totalItems": followers.len(),
        "orderedItems": followers,
    })
}

/// Outbox collection; posts are served by the post store, not from here
pub fn outbox_collection(iris: &BlogIris) -> serde_json::Value {
    json!({
        "@context": AS_CONTEXT,
        "id": iris.outbox,
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": [],
    })
}

/// Minimal HTML page for browsers hitting an actor URL
pub fn actor_html_stub(config: &AppConfig, iris: &BlogIris) -> String {
    let title = config
        .blog(&iris.blog)
        .map(|b| b.title.as_str())
        .unwrap_or(iris.blog.as_str());
    let lang = config
        .blog(&iris.blog)
        .map(|b| b.lang.as_str())
        .unwrap_or("en");
    format!(
        "<!doctype html><html lang=\"{lang}\"><head><meta charset=\"utf-8\"><title>{title}</title>\
         <link rel=\"alternate\" type=\"{ACTIVITY_JSON}\" href=\"{href}\"></head>\
         <body><h1>{title}</h1></body></html>",
        lang = html_escape::encode_double_quoted_attribute(lang),
        title = html_escape::encode_text(title),
        href = html_escape::encode_double_quoted_attribute(&iris.actor),
    )
}
