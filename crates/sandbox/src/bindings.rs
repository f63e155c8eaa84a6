//! Host API bindings for widget code
//!
//! The Rust side registers flat `__widgeon_*` globals that speak strings
//! and JSON. A bootstrap script, evaluated once per worker, wraps them into
//! the `chat`, `host` and `messages` namespaces plus the autovivified
//! `session` scratch object. The namespaces are handed to the function
//! link set as dependencies rather than left as globals.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rquickjs::function::{Func, Rest};
use rquickjs::{CatchResultExt, Ctx, Object, Persistent, Value};
use tokio::sync::mpsc::UnboundedSender;

use widgeon_protocol::{ActionRequest, GuestMessage};

use crate::broker::RoundTripBroker;
use crate::tick::{MessageLog, TickWindow};
use crate::worker::{await_resolution, Mailbox};
use crate::SandboxError;

const BOOTSTRAP: &str = r#"
(function () {
  var autogenerated = Symbol('autogenerated');

  function autovivify() {
    var target = {};
    target[autogenerated] = false;
    return new Proxy(target, {
      get: function (t, prop) {
        if (prop in t) return t[prop];
        t[prop] = autovivify();
        t[prop][autogenerated] = true;
        return t[prop];
      },
      set: function (t, prop, value) {
        if (prop === autogenerated) return true;
        t[prop] = value;
        return true;
      },
    });
  }

  var chat = {
    sendMessage: function (text) {
      __widgeon_send_message(String(text));
    },
    deleteMessage: function (messageId) {
      __widgeon_delete_message(String(messageId));
    },
    banUser: function (login, expiresIn, reason) {
      __widgeon_ban_user(
        String(login),
        String(expiresIn),
        reason === undefined ? '' : String(reason)
      );
    },
  };

  var host = {
    captureScreenshot: function (format) {
      return JSON.parse(
        __widgeon_capture_screenshot(format === undefined ? 'png' : String(format))
      );
    },
    relationship: function (viewer, channel) {
      return JSON.parse(__widgeon_relationship(String(viewer), String(channel)));
    },
    playAudio: function (url) {
      return __widgeon_play_audio(String(url));
    },
  };

  var messages = {
    sinceLastTick: function (filter) {
      var rows = JSON.parse(__widgeon_messages_query());
      if (filter !== undefined) rows = rows.filter(filter);
      if (rows.length > 0) {
        var top = rows[rows.length - 1].timestamp;
        var ids = [];
        for (var i = 0; i < rows.length; i++) {
          if (rows[i].timestamp === top) ids.push(rows[i].id);
        }
        __widgeon_messages_commit(top, JSON.stringify(ids));
      }
      return rows;
    },
  };

  return { session: autovivify(), chat: chat, host: host, messages: messages };
})()
"#;

/// Shared state the raw bindings close over
pub(crate) struct BindingContext {
    pub outbox: UnboundedSender<GuestMessage>,
    pub mailbox: Rc<RefCell<Mailbox>>,
    pub broker: Rc<RefCell<RoundTripBroker>>,
    pub window: Rc<RefCell<TickWindow>>,
    pub log: MessageLog,
    pub round_trip_timeout: Duration,
}

/// Namespace objects produced by the bootstrap, saved for dependency
/// injection into every composed function
pub(crate) struct HostEnvironment {
    pub session: Persistent<Value<'static>>,
    pub chat: Persistent<Value<'static>>,
    pub host: Persistent<Value<'static>>,
    pub messages: Persistent<Value<'static>>,
}

fn init_err(err: rquickjs::Error) -> SandboxError {
    SandboxError::Init(err.to_string())
}

fn send_action(outbox: &UnboundedSender<GuestMessage>, action: ActionRequest) {
    if outbox.send(GuestMessage::Action { action }).is_err() {
        tracing::debug!("host disconnected, dropping action");
    }
}

/// Register the raw globals and evaluate the bootstrap
pub(crate) fn install(
    ctx: &Ctx<'_>,
    binding: &BindingContext,
) -> Result<HostEnvironment, SandboxError> {
    let globals = ctx.globals();

    let console = Object::new(ctx.clone()).map_err(init_err)?;
    console
        .set(
            "log",
            Func::from(move |args: Rest<String>| {
                let line = args.0.join(" ");
                tracing::debug!(target: "widgeon::widget", "{line}");
            }),
        )
        .map_err(init_err)?;
    globals.set("console", console).map_err(init_err)?;

    let outbox = binding.outbox.clone();
    globals
        .set(
            "__widgeon_send_message",
            Func::from(move |text: String| {
                send_action(&outbox, ActionRequest::SendMessage { text });
            }),
        )
        .map_err(init_err)?;

    let outbox = binding.outbox.clone();
    globals
        .set(
            "__widgeon_delete_message",
            Func::from(move |message_id: String| {
                send_action(&outbox, ActionRequest::DeleteMessage { message_id });
            }),
        )
        .map_err(init_err)?;

    let outbox = binding.outbox.clone();
    globals
        .set(
            "__widgeon_ban_user",
            Func::from(move |login: String, expires_in: String, reason: String| {
                send_action(
                    &outbox,
                    ActionRequest::BanUser {
                        login,
                        expires_in,
                        reason,
                    },
                );
            }),
        )
        .map_err(init_err)?;

    let outbox = binding.outbox.clone();
    let mailbox = binding.mailbox.clone();
    let broker = binding.broker.clone();
    let timeout = binding.round_trip_timeout;
    globals
        .set(
            "__widgeon_capture_screenshot",
            Func::from(move |format: String| -> String {
                let waiter = broker.borrow_mut().begin_screenshot();
                send_action(&outbox, ActionRequest::CaptureScreenshot { format });
                match await_resolution(&mailbox, &broker, &waiter, timeout) {
                    Some(shot) => {
                        serde_json::to_string(&shot).unwrap_or_else(|_| "null".to_string())
                    }
                    None => "null".to_string(),
                }
            }),
        )
        .map_err(init_err)?;

    let outbox = binding.outbox.clone();
    let mailbox = binding.mailbox.clone();
    let broker = binding.broker.clone();
    let timeout = binding.round_trip_timeout;
    globals
        .set(
            "__widgeon_relationship",
            Func::from(move |viewer: String, channel: String| -> String {
                let waiter = broker
                    .borrow_mut()
                    .begin_relationship(viewer.clone(), channel.clone());
                send_action(&outbox, ActionRequest::Relationship { viewer, channel });
                let relationship =
                    await_resolution(&mailbox, &broker, &waiter, timeout).flatten();
                serde_json::to_string(&relationship).unwrap_or_else(|_| "null".to_string())
            }),
        )
        .map_err(init_err)?;

    let outbox = binding.outbox.clone();
    let mailbox = binding.mailbox.clone();
    let broker = binding.broker.clone();
    let timeout = binding.round_trip_timeout;
    globals
        .set(
            "__widgeon_play_audio",
            Func::from(move |url: String| -> bool {
                let (request_id, waiter) = broker.borrow_mut().begin_audio();
                send_action(&outbox, ActionRequest::PlayAudio { request_id, url });
                await_resolution(&mailbox, &broker, &waiter, timeout).unwrap_or(false)
            }),
        )
        .map_err(init_err)?;

    let window = binding.window.clone();
    let log = binding.log.clone();
    globals
        .set(
            "__widgeon_messages_query",
            Func::from(move || -> String {
                let rows = window.borrow_mut().query(&log);
                serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
            }),
        )
        .map_err(init_err)?;

    let window = binding.window.clone();
    globals
        .set(
            "__widgeon_messages_commit",
            Func::from(move |top: f64, ids_json: String| {
                let ids: Vec<String> = serde_json::from_str(&ids_json).unwrap_or_default();
                window.borrow_mut().commit(top as i64, ids);
            }),
        )
        .map_err(init_err)?;

    let env: Object = ctx
        .eval(BOOTSTRAP)
        .catch(ctx)
        .map_err(|e| SandboxError::Init(e.to_string()))?;
    let session: Value = env.get("session").map_err(init_err)?;
    let chat: Value = env.get("chat").map_err(init_err)?;
    let host: Value = env.get("host").map_err(init_err)?;
    let messages: Value = env.get("messages").map_err(init_err)?;

    Ok(HostEnvironment {
        session: Persistent::save(ctx, session),
        chat: Persistent::save(ctx, chat),
        host: Persistent::save(ctx, host),
        messages: Persistent::save(ctx, messages),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use std::sync::mpsc::channel;
    use widgeon_protocol::{AudioId, ChatMessage, HostMessage};

    struct Fixture {
        binding: BindingContext,
        host_tx: std::sync::mpsc::Sender<HostMessage>,
        guest_rx: tokio::sync::mpsc::UnboundedReceiver<GuestMessage>,
    }

    fn fixture(round_trip_timeout: Duration) -> Fixture {
        let (host_tx, inbox) = channel();
        let (outbox, guest_rx) = tokio::sync::mpsc::unbounded_channel();
        let binding = BindingContext {
            outbox,
            mailbox: Rc::new(RefCell::new(Mailbox::new(inbox))),
            broker: Rc::new(RefCell::new(RoundTripBroker::new())),
            window: Rc::new(RefCell::new(TickWindow::new(0))),
            log: MessageLog::new(),
            round_trip_timeout,
        };
        Fixture {
            binding,
            host_tx,
            guest_rx,
        }
    }

    fn with_env<R>(
        fixture: &Fixture,
        f: impl FnOnce(&Ctx<'_>) -> R,
    ) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let env = install(&ctx, &fixture.binding).unwrap();
            let globals = ctx.globals();
            globals
                .set("session", env.session.clone().restore(&ctx).unwrap())
                .unwrap();
            globals
                .set("chat", env.chat.clone().restore(&ctx).unwrap())
                .unwrap();
            globals
                .set("host", env.host.clone().restore(&ctx).unwrap())
                .unwrap();
            globals
                .set("messages", env.messages.clone().restore(&ctx).unwrap())
                .unwrap();
            f(&ctx)
        })
    }

    fn message(id: &str, ts: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            room_id: "r".into(),
            room_display_name: "Room".into(),
            user_id: "u".into(),
            display_name: "Viewer".into(),
            text: "hello".into(),
            subscriber: true,
            moderator: false,
            vip: false,
            turbo: false,
            returning: false,
            first_message: false,
            badges: Vec::new(),
            color: String::new(),
            timestamp: ts,
        }
    }

    #[test]
    fn chat_actions_reach_the_outbox() {
        let mut fx = fixture(Duration::from_millis(100));
        with_env(&fx, |ctx| {
            ctx.eval::<(), _>("chat.sendMessage('hi'); chat.banUser('spammer', '10m');")
                .unwrap();
        });
        match fx.guest_rx.try_recv().unwrap() {
            GuestMessage::Action {
                action: ActionRequest::SendMessage { text },
            } => assert_eq!(text, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
        match fx.guest_rx.try_recv().unwrap() {
            GuestMessage::Action {
                action: ActionRequest::BanUser { reason, .. },
            } => assert_eq!(reason, ""),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn session_autovivifies_nested_paths() {
        let fx = fixture(Duration::from_millis(100));
        let value: i32 = with_env(&fx, |ctx| {
            ctx.eval("session.stats.wins = 3; session.stats.wins").unwrap()
        });
        assert_eq!(value, 3);
    }

    #[test]
    fn play_audio_consumes_a_prefed_resolution() {
        let mut fx = fixture(Duration::from_millis(500));
        // The first minted audio id is 0; resolve it before the call blocks
        fx.host_tx
            .send(HostMessage::PlayAudio {
                request_id: AudioId(0),
                success: true,
            })
            .unwrap();
        let ok: bool = with_env(&fx, |ctx| ctx.eval("host.playAudio('clip.mp3')").unwrap());
        assert!(ok);
        assert!(matches!(
            fx.guest_rx.try_recv().unwrap(),
            GuestMessage::Action {
                action: ActionRequest::PlayAudio { .. }
            }
        ));
    }

    #[test]
    fn unresolved_capture_returns_null() {
        let fx = fixture(Duration::from_millis(20));
        let is_null: bool = with_env(&fx, |ctx| {
            ctx.eval("host.captureScreenshot('png') === null").unwrap()
        });
        assert!(is_null);
    }

    #[test]
    fn messages_namespace_queries_and_filters() {
        let fx = fixture(Duration::from_millis(100));
        fx.binding.log.append(message("a", 10));
        fx.binding.log.append(message("b", 20));
        let count: i32 = with_env(&fx, |ctx| {
            ctx.eval("messages.sinceLastTick(function (m) { return m.subscriber; }).length")
                .unwrap()
        });
        assert_eq!(count, 2);
        assert_eq!(fx.binding.window.borrow().high_water_mark(), 20);
    }
}
