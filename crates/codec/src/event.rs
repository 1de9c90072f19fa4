use serde::Deserialize;

use crate::Error;

/// The web address under which a post can be opened.
pub const PROFILE_URL: &str = "https://bsky.app/profile";

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Default)]
struct Record {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Commit {
    operation: Operation,
    #[serde(default)]
    rkey: String,
    #[serde(default)]
    record: Option<Record>,
}

#[derive(Deserialize, Debug)]
struct Frame {
    #[serde(default)]
    did: String,
    kind: Kind,
    #[serde(default)]
    commit: Option<Commit>,
}

/// A newly created post, taken from a Jetstream commit frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// The DID of the author.
    pub did: String,
    /// The record key of the post inside the author's repository.
    pub rkey: String,
    /// The body of the post, empty if the record carries no text.
    pub text: String,
}

impl Post {
    /// Decode a Jetstream frame.
    ///
    /// Only `commit` frames with a `create` operation are posts. Every other
    /// frame (identity and account updates, edits, deletions) decodes to
    /// `None`. A frame that is not JSON, or a commit frame without its commit
    /// body, is an error.
    ///
    /// ```
    /// use emoji_relay_codec::event::Post;
    ///
    /// let frame = r#"{
    ///     "did": "did:plc:abc",
    ///     "kind": "commit",
    ///     "commit": {
    ///         "operation": "create",
    ///         "collection": "app.bsky.feed.post",
    ///         "rkey": "3k2",
    ///         "record": { "text": "hi 👋" }
    ///     }
    /// }"#;
    ///
    /// let post = Post::decode(frame.as_bytes()).unwrap().unwrap();
    /// assert_eq!(post.text, "hi 👋");
    /// assert_eq!(post.url(), "https://bsky.app/profile/did:plc:abc/post/3k2");
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, Error> {
        let frame: Frame = serde_json::from_slice(bytes)?;
        if frame.kind != Kind::Commit {
            return Ok(None);
        }

        let commit = frame.commit.ok_or(Error::InvalidMessage)?;
        if commit.operation != Operation::Create {
            return Ok(None);
        }

        Ok(Some(Self {
            text: commit.record.and_then(|it| it.text).unwrap_or_default(),
            rkey: commit.rkey,
            did: frame.did,
        }))
    }

    pub fn url(&self) -> String {
        format!("{}/{}/post/{}", PROFILE_URL, self.did, self.rkey)
    }
}
