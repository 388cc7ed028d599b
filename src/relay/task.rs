use std::sync::Arc;

use chrono::Utc;

use super::{GenerateRequest, Inner, Slot, Status};
use crate::billing::Decision;
use crate::dispatch::{ChatCall, ChatMessage, DeltaSink, Frame, FrameSink, ModelInfo};
use crate::store::{Account, HistoryEntry};
use crate::tags;

/// Pushes `Error` + `End` if the task unwinds before its normal end, so
/// consumers never wait on a queue nobody will finish.
struct EndGuard {
    slot: Arc<Slot>,
    armed: bool,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(message_id = %self.slot.message_id, "generation task ended abnormally");
            self.slot
                .push(Frame::Error("generation aborted unexpectedly".to_string()));
            self.slot.finish(Status::Error);
            self.slot.push(Frame::End);
        }
    }
}

/// Background body of one generation. The slot already exists and is
/// `Running`; this always ends by pushing exactly one `End`.
pub(super) async fn run(inner: Arc<Inner>, slot: Arc<Slot>, req: GenerateRequest) {
    let mut guard = EndGuard {
        slot: Arc::clone(&slot),
        armed: true,
    };

    generate(&inner, &slot, req).await;

    guard.armed = false;
    slot.push(Frame::End);
    inner.schedule_cleanup(&slot);
}

fn reject(slot: &Slot, reason: String) {
    tracing::info!(message_id = %slot.message_id, %reason, "generation rejected");
    slot.push(Frame::Error(reason));
    slot.finish(Status::Error);
}

async fn resolve_account(inner: &Inner, user_id: Option<&str>) -> Option<Account> {
    let user_id = user_id?;
    match inner.accounts.get(user_id).await {
        Ok(Some(account)) => Some(account),
        Ok(None) => {
            tracing::warn!(user_id, "unknown account, treating caller as anonymous");
            None
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "account lookup failed, treating caller as anonymous");
            None
        }
    }
}

async fn persist(inner: &Inner, conversation_id: &str, history: &[HistoryEntry]) {
    if let Err(e) = inner.history.save(conversation_id, history).await {
        tracing::warn!(conversation_id, error = %e, "failed to save history");
    }
}

/// The stored form of the user turn, and the image to send inline (vision
/// models only). Other models get a text description spliced in.
async fn prepare_turn(
    inner: &Inner,
    model: &ModelInfo,
    req: &GenerateRequest,
    user_id: Option<&str>,
) -> (String, Option<String>) {
    let Some(image) = req.attachment.as_deref() else {
        return (req.prompt.clone(), None);
    };
    let raw = tags::base64_block(image);

    if model.vision {
        return (format!("{}\n\n{raw}", req.prompt), Some(image.to_string()));
    }

    match inner.provider.describe_image(image).await {
        Ok(description) => {
            if let Some(user_id) = user_id {
                if let Err(e) = inner
                    .billing
                    .record_usage(user_id, &description.model, description.usage)
                    .await
                {
                    tracing::warn!(user_id, error = %e, "failed to record image description usage");
                }
            }
            let note = tags::image_block(&format!(
                "The user uploaded an image. Description: {}",
                description.text
            ));
            (format!("{}\n\n{note}\n\n{raw}", req.prompt), None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "image description failed, continuing without it");
            (format!("{}\n\n{raw}", req.prompt), None)
        }
    }
}

async fn generate(inner: &Inner, slot: &Arc<Slot>, req: GenerateRequest) {
    let account = resolve_account(inner, req.user_id.as_deref()).await;
    let billed_user = account.as_ref().map(|a| a.user_id.clone());

    let model = match inner.provider.resolve(&req.model) {
        Ok(m) => m,
        Err(e) => return reject(slot, e.user_message()),
    };

    let ticket = match inner.billing.precheck(account.as_ref(), &model).await {
        Decision::Allow(ticket) => ticket,
        Decision::Deny(reason) => return reject(slot, reason),
    };
    let tier = account
        .as_ref()
        .map(|a| a.effective_tier(Utc::now()))
        .unwrap_or_default();
    let max_tokens = inner.billing.max_tokens_for(tier);

    let mut history = match inner.history.load(&req.conversation_id).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(conversation_id = %req.conversation_id, error = %e,
                "failed to load history, continuing with an empty conversation");
            Vec::new()
        }
    };

    let (user_turn, image) = prepare_turn(inner, &model, &req, billed_user.as_deref()).await;
    history.push(HistoryEntry::user(user_turn));
    persist(inner, &req.conversation_id, &history).await;

    let messages = history
        .iter()
        .map(|e| ChatMessage::text(e.role, tags::strip_for_replay(e.role, &e.content)))
        .collect();
    let call = ChatCall {
        model: model.name.clone(),
        messages,
        image,
        web_search: req.web_search,
        max_tokens,
    };

    let sink = DeltaSink::to(slot.clone());
    let outcome = inner.provider.stream(call, &sink, &slot.cancel).await;

    history.push(HistoryEntry::assistant(format!(
        "{}{}",
        tags::model_tag(&model.name),
        outcome.text
    )));
    persist(inner, &req.conversation_id, &history).await;

    let failed = outcome.is_failed();
    slot.finish(if failed { Status::Error } else { Status::Finished });

    if failed {
        return;
    }
    let Some(user_id) = billed_user.as_deref() else {
        return;
    };
    if let Err(e) = inner
        .billing
        .record_usage(user_id, &model.name, outcome.usage)
        .await
    {
        tracing::warn!(user_id, error = %e, "failed to record usage");
    }
    if let Err(e) = inner
        .billing
        .settle(user_id, &model, ticket, outcome.usage)
        .await
    {
        tracing::warn!(user_id, error = %e, "failed to settle generation");
    }
}
