//! grammers-backed protocol client.
//!
//! All raw TL invocations live here; everything above this module speaks
//! [`TelegramApi`]. Server-side error codes are classified by message text,
//! since the client library renders them into its error's `Display` output.

use std::{path::{Path, PathBuf}, sync::Arc};

use {
    async_trait::async_trait,
    grammers_client::{Client, Config, InitParams, SignInError},
    grammers_client::grammers_tl_types as tl,
    grammers_session::Session,
    rand::Rng,
    tracing::{debug, warn},
};

use embergram_common::Recipient;

use crate::{
    api::{ApiError, ContactFlags, LoginStep, MediaRef, SentMedia, TelegramApi, classify_invocation},
    error::{Error, Result},
    manager::Connector,
    settings::ClientSettings,
};

const UPLOAD_PART_SIZE: usize = 512 * 1024;
const BIG_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Builds live [`GrammersApi`] handles for the session manager.
pub struct GrammersConnector;

#[async_trait]
impl Connector for GrammersConnector {
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn TelegramApi>> {
        let session = load_session(&settings.session_path)?;

        let client = Client::connect(Config {
            session,
            api_id: settings.api_id,
            api_hash: settings.api_hash_value(),
            params: InitParams::default(),
        })
        .await
        .map_err(|error| Error::Api(classify_invocation("connect", error)))?;

        debug!(session_path = %settings.session_path.display(), "protocol client connected");

        Ok(Arc::new(GrammersApi {
            client,
            session_path: settings.session_path.clone(),
            login_token: std::sync::Mutex::new(None),
            password_token: std::sync::Mutex::new(None),
        }))
    }
}

/// Load the persisted session artifact, enforcing the structural validity
/// check the recovery loop depends on: an unreadable or empty artifact is
/// reported as corrupt, never silently replaced.
fn load_session(path: &Path) -> Result<Session> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            return Err(Error::CorruptArtifact {
                detail: "artifact is empty".to_owned(),
            });
        }
        return Session::load_file(path).map_err(|error| Error::CorruptArtifact {
            detail: error.to_string(),
        });
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Session::new())
}

pub struct GrammersApi {
    client: Client,
    session_path: PathBuf,
    login_token: std::sync::Mutex<Option<grammers_client::types::LoginToken>>,
    password_token: std::sync::Mutex<Option<grammers_client::types::PasswordToken>>,
}

impl GrammersApi {
    fn input_user(recipient: &Recipient) -> tl::enums::InputUser {
        tl::enums::InputUser::User(tl::types::InputUser {
            user_id: recipient.user_id,
            access_hash: recipient.access_hash,
        })
    }

    fn input_peer(recipient: &Recipient) -> tl::enums::InputPeer {
        tl::enums::InputPeer::User(tl::types::InputPeerUser {
            user_id: recipient.user_id,
            access_hash: recipient.access_hash,
        })
    }

    async fn send_media(
        &self,
        recipient: &Recipient,
        media: tl::enums::InputMedia,
    ) -> std::result::Result<SentMedia, ApiError> {
        let request = tl::functions::messages::SendMedia {
            silent: false,
            background: false,
            clear_draft: false,
            noforwards: false,
            update_stickersets_order: false,
            invert_media: false,
            peer: Self::input_peer(recipient),
            reply_to: None,
            media,
            message: String::new(),
            random_id: rand::rng().random(),
            reply_markup: None,
            entities: None,
            schedule_date: None,
            send_as: None,
            quick_reply_shortcut: None,
            effect: None,
        };

        let updates = self
            .client
            .invoke(&request)
            .await
            .map_err(|error| classify_invocation("send media", error))?;

        extract_sent_media(updates).ok_or(ApiError::Transport {
            context: "send media",
            message: "send response carried no photo".to_owned(),
        })
    }

    /// Part-wise upload. Files above the big-file threshold skip the md5
    /// bookkeeping and use the big-part calls, as the protocol requires.
    async fn upload_photo(&self, path: &Path) -> std::result::Result<tl::enums::InputFile, ApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| ApiError::Transport {
                context: "read upload source",
                message: error.to_string(),
            })?;
        let total = bytes.len();
        let parts = part_count(total);
        let big = total as u64 > BIG_FILE_THRESHOLD;
        let file_id: i64 = rand::rng().random();
        let name = file_name(path);

        for (index, chunk) in bytes.chunks(UPLOAD_PART_SIZE).enumerate() {
            let part = index as i32;
            let saved = if big {
                self.client
                    .invoke(&tl::functions::upload::SaveBigFilePart {
                        file_id,
                        file_part: part,
                        file_total_parts: parts,
                        bytes: chunk.to_vec(),
                    })
                    .await
            } else {
                self.client
                    .invoke(&tl::functions::upload::SaveFilePart {
                        file_id,
                        file_part: part,
                        bytes: chunk.to_vec(),
                    })
                    .await
            }
            .map_err(|error| classify_invocation("upload part", error))?;

            if !saved {
                return Err(ApiError::Transport {
                    context: "upload part",
                    message: format!("server rejected part {part} of {parts}"),
                });
            }
        }

        debug!(file = %path.display(), parts, big, "photo uploaded");

        Ok(if big {
            tl::enums::InputFile::Big(tl::types::InputFileBig {
                id: file_id,
                parts,
                name,
            })
        } else {
            tl::enums::InputFile::File(tl::types::InputFile {
                id: file_id,
                parts,
                name,
                md5_checksum: String::new(),
            })
        })
    }
}

#[async_trait]
impl TelegramApi for GrammersApi {
    async fn is_authorized(&self) -> std::result::Result<bool, ApiError> {
        self.client
            .is_authorized()
            .await
            .map_err(|error| classify_invocation("authorization check", error))
    }

    async fn request_login_code(&self, phone: &str) -> std::result::Result<(), ApiError> {
        let token = self
            .client
            .request_login_code(phone)
            .await
            .map_err(|error| classify_invocation("request login code", error))?;
        *self.login_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        *self.password_token.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn submit_code(&self, code: &str) -> std::result::Result<LoginStep, ApiError> {
        let token = self
            .login_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ApiError::Transport {
                context: "sign in",
                message: "no login code was requested".to_owned(),
            })?;

        match self.client.sign_in(&token, code).await {
            Ok(_) => Ok(LoginStep::Done),
            Err(SignInError::InvalidCode) => {
                // Keep the token so the operator can retry the code.
                *self.login_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
                Err(ApiError::InvalidCode)
            },
            Err(SignInError::PasswordRequired(password_token)) => {
                *self.password_token.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(password_token);
                Ok(LoginStep::PasswordRequired)
            },
            Err(SignInError::SignUpRequired { .. }) => Err(ApiError::Transport {
                context: "sign in",
                message: "no account exists for this phone number".to_owned(),
            }),
            Err(SignInError::InvalidPassword) => Err(ApiError::WrongPassword),
            Err(SignInError::Other(error)) => Err(classify_invocation("sign in", error)),
        }
    }

    async fn submit_password(&self, password: &str) -> std::result::Result<LoginStep, ApiError> {
        let token = self
            .password_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ApiError::Transport {
                context: "check password",
                message: "no password challenge is pending".to_owned(),
            })?;

        match self.client.check_password(token, password).await {
            Ok(_) => {
                *self.password_token.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(LoginStep::Done)
            },
            // The stored token stays valid for another attempt.
            Err(SignInError::InvalidPassword) => Err(ApiError::WrongPassword),
            Err(SignInError::InvalidCode) => Err(ApiError::InvalidCode),
            Err(SignInError::PasswordRequired(_)) | Err(SignInError::SignUpRequired { .. }) => {
                Err(ApiError::Transport {
                    context: "check password",
                    message: "unexpected sign-in state".to_owned(),
                })
            },
            Err(SignInError::Other(error)) => Err(classify_invocation("check password", error)),
        }
    }

    async fn persist_session(&self) -> std::result::Result<(), ApiError> {
        self.client
            .session()
            .save_to_file(&self.session_path)
            .map_err(|error| ApiError::Transport {
                context: "persist session",
                message: error.to_string(),
            })
    }

    async fn disconnect(&self) {
        // The transport closes when the last clone of the client drops;
        // flush the session artifact so the authorization survives.
        if let Err(error) = self.persist_session().await {
            warn!(%error, "failed to persist session during disconnect");
        }
    }

    async fn contact_flags(
        &self,
        recipient: &Recipient,
    ) -> std::result::Result<ContactFlags, ApiError> {
        let users = self
            .client
            .invoke(&tl::functions::users::GetUsers {
                id: vec![Self::input_user(recipient)],
            })
            .await
            .map_err(|error| classify_invocation("contact flags", error))?;

        Ok(users
            .into_iter()
            .next()
            .and_then(|user| match user {
                tl::enums::User::User(user) => Some(ContactFlags {
                    contact: user.contact,
                    mutual_contact: user.mutual_contact,
                }),
                tl::enums::User::Empty(_) => None,
            })
            .unwrap_or_default())
    }

    async fn add_contact(
        &self,
        recipient: &Recipient,
        first_name: &str,
    ) -> std::result::Result<(), ApiError> {
        self.client
            .invoke(&tl::functions::contacts::AddContact {
                add_phone_privacy_exception: false,
                id: Self::input_user(recipient),
                first_name: first_name.to_owned(),
                last_name: String::new(),
                phone: String::new(),
            })
            .await
            .map_err(|error| classify_invocation("add contact", error))?;
        Ok(())
    }

    async fn send_cached_media(
        &self,
        recipient: &Recipient,
        media: &MediaRef,
        ttl_seconds: i32,
    ) -> std::result::Result<SentMedia, ApiError> {
        let input = tl::enums::InputMedia::Photo(tl::types::InputMediaPhoto {
            spoiler: false,
            id: tl::enums::InputPhoto::Photo(tl::types::InputPhoto {
                id: media.photo_id,
                access_hash: media.access_hash,
                file_reference: media.file_reference.clone(),
            }),
            ttl_seconds: Some(ttl_seconds),
        });
        self.send_media(recipient, input).await
    }

    async fn upload_and_send(
        &self,
        recipient: &Recipient,
        path: &Path,
        ttl_seconds: i32,
    ) -> std::result::Result<SentMedia, ApiError> {
        let file = self.upload_photo(path).await?;
        let input = tl::enums::InputMedia::UploadedPhoto(tl::types::InputMediaUploadedPhoto {
            spoiler: false,
            file,
            stickers: None,
            ttl_seconds: Some(ttl_seconds),
        });
        self.send_media(recipient, input).await
    }

    async fn refetch_media(
        &self,
        message_id: i32,
    ) -> std::result::Result<Option<MediaRef>, ApiError> {
        let response = self
            .client
            .invoke(&tl::functions::messages::GetMessages {
                id: vec![tl::enums::InputMessage::Id(tl::types::InputMessageId {
                    id: message_id,
                })],
            })
            .await
            .map_err(|error| classify_invocation("refetch message", error))?;

        let messages = match response {
            tl::enums::messages::Messages::Messages(data) => data.messages,
            tl::enums::messages::Messages::Slice(data) => data.messages,
            tl::enums::messages::Messages::ChannelMessages(data) => data.messages,
            tl::enums::messages::Messages::NotModified(_) => return Ok(None),
        };

        Ok(messages.into_iter().find_map(|message| match message {
            tl::enums::Message::Message(data) => media_ref_from_media(data.media.as_ref()),
            _ => None,
        }))
    }
}

fn part_count(total_bytes: usize) -> i32 {
    (total_bytes.div_ceil(UPLOAD_PART_SIZE)).max(1) as i32
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "photo.jpg".to_owned())
}

fn media_ref_from_media(media: Option<&tl::enums::MessageMedia>) -> Option<MediaRef> {
    let tl::enums::MessageMedia::Photo(photo_media) = media? else {
        return None;
    };
    let tl::enums::Photo::Photo(photo) = photo_media.photo.as_ref()? else {
        return None;
    };
    Some(MediaRef {
        photo_id: photo.id,
        access_hash: photo.access_hash,
        file_reference: photo.file_reference.clone(),
    })
}

/// Dig the freshly sent photo out of the updates the server returns for a
/// media send, so the cached reference can be rotated without a refetch.
fn extract_sent_media(updates: tl::enums::Updates) -> Option<SentMedia> {
    let updates = match updates {
        tl::enums::Updates::Updates(data) => data.updates,
        tl::enums::Updates::Combined(data) => data.updates,
        _ => return None,
    };

    updates.into_iter().find_map(|update| {
        let tl::enums::Update::NewMessage(new_message) = update else {
            return None;
        };
        let tl::enums::Message::Message(message) = new_message.message else {
            return None;
        };
        media_ref_from_media(message.media.as_ref()).map(|media| SentMedia {
            message_id: message.id,
            media,
        })
    })
}
