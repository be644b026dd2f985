//! ActivityPub federation module
//!
//! Handles:
//! - Actor documents and host-aware IRIs
//! - Activity processing (inbox)
//! - Post fanout (outbox) and the delivery worker
//! - HTTP Signatures
//! - WebFinger
//! - Remote actor fetching
//! - Domain and account moves

mod activity;
mod actor;
mod delivery;
mod domain_move;
mod outbox;
mod remote;
mod signature;
mod webfinger;

pub use activity::{ActivityProcessor, ActivityType, InboxRequest, build_move, clean_html_text};
pub use actor::{
    ACTIVITY_JSON, AS_CONTEXT, AS_PUBLIC, ActorState, BlogIris, actor_document, actor_html_stub,
    also_known_as, find_local_actor, followers_collection, is_blog_iri, is_local_url, key_id_for,
    outbox_collection, wants_activity_json,
};
pub use delivery::{
    DELIVERY_TOPIC, DeliveryClass, DeliveryQueue, DeliveryRequest, DeliveryWorker, classify_status,
    unique_inbox_targets,
};
pub use domain_move::{
    FollowerCheck, FollowerStatus, IdentityState, MoveEngine, MoveReport, RefetchReport,
};
pub use outbox::{Outbox, audience, new_activity_id, run_post_listener};
pub use remote::{RemoteActor, RemoteActors, ensure_fetchable, parse_actor};
pub use signature::{
    InstanceKey, MAX_DATE_SKEW_SECS, ParsedSignature, SignatureHeaders, extract_signature_key_id,
    generate_digest, key_owner, parse_public_key_pem, parse_signature_header, sign_request,
    verify_signature,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, lookup_resource, parse_handle,
    resolve_webfinger,
};
