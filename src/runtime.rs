use std::collections::BTreeMap;
use std::sync::Arc;

use crate::classpath::ExternalClass;
use crate::ir::{AccessFlags, MemberDesc};
use crate::library::Library;

struct BuiltinClass {
    name: &'static str,
    super_name: Option<&'static str>,
    interfaces: &'static [&'static str],
    interface: bool,
    /// `(name, descriptor, native)`
    methods: &'static [(&'static str, &'static str, bool)],
}

const OBJECT: &str = "java/lang/Object";

const fn class(
    name: &'static str,
    super_name: &'static str,
    interfaces: &'static [&'static str],
    methods: &'static [(&'static str, &'static str, bool)],
) -> BuiltinClass {
    BuiltinClass {
        name,
        super_name: Some(super_name),
        interfaces,
        interface: false,
        methods,
    }
}

const fn interface(
    name: &'static str,
    interfaces: &'static [&'static str],
    methods: &'static [(&'static str, &'static str, bool)],
) -> BuiltinClass {
    BuiltinClass {
        name,
        super_name: Some(OBJECT),
        interfaces,
        interface: true,
        methods,
    }
}

const KEY_EVENT: &str = "(Ljava/awt/event/KeyEvent;)V";
const MOUSE_EVENT: &str = "(Ljava/awt/event/MouseEvent;)V";
const FOCUS_EVENT: &str = "(Ljava/awt/event/FocusEvent;)V";
const WINDOW_EVENT: &str = "(Ljava/awt/event/WindowEvent;)V";
const GRAPHICS: &str = "(Ljava/awt/Graphics;)V";
const IMAGE_CONSUMER: &str = "(Ljava/awt/image/ImageConsumer;)V";

/// Platform classes the client is known to extend or implement.
const BUILTIN: &[BuiltinClass] = &[
    BuiltinClass {
        name: OBJECT,
        super_name: None,
        interfaces: &[],
        interface: false,
        methods: &[
            ("<init>", "()V", false),
            ("clone", "()Ljava/lang/Object;", true),
            ("equals", "(Ljava/lang/Object;)Z", false),
            ("finalize", "()V", false),
            ("getClass", "()Ljava/lang/Class;", true),
            ("hashCode", "()I", true),
            ("notify", "()V", true),
            ("notifyAll", "()V", true),
            ("toString", "()Ljava/lang/String;", false),
            ("wait", "()V", false),
            ("wait", "(J)V", true),
            ("wait", "(JI)V", false),
        ],
    },
    interface("java/io/Serializable", &[], &[]),
    interface("java/lang/Cloneable", &[], &[]),
    interface("java/lang/Comparable", &[], &[("compareTo", "(Ljava/lang/Object;)I", false)]),
    interface("java/lang/Runnable", &[], &[("run", "()V", false)]),
    class(
        "java/lang/Thread",
        OBJECT,
        &["java/lang/Runnable"],
        &[
            ("<init>", "()V", false),
            ("<init>", "(Ljava/lang/Runnable;)V", false),
            ("run", "()V", false),
            ("start", "()V", false),
        ],
    ),
    class(
        "java/lang/Throwable",
        OBJECT,
        &["java/io/Serializable"],
        &[
            ("<init>", "()V", false),
            ("<init>", "(Ljava/lang/String;)V", false),
            ("getMessage", "()Ljava/lang/String;", false),
            ("printStackTrace", "()V", false),
        ],
    ),
    class("java/lang/Exception", "java/lang/Throwable", &[], &[("<init>", "()V", false)]),
    class(
        "java/lang/RuntimeException",
        "java/lang/Exception",
        &[],
        &[("<init>", "()V", false), ("<init>", "(Ljava/lang/String;)V", false)],
    ),
    interface("java/util/EventListener", &[], &[]),
    interface(
        "java/awt/image/ImageObserver",
        &[],
        &[("imageUpdate", "(Ljava/awt/Image;IIIII)Z", false)],
    ),
    interface(
        "java/awt/image/ImageProducer",
        &[],
        &[
            ("addConsumer", IMAGE_CONSUMER, false),
            ("isConsumer", "(Ljava/awt/image/ImageConsumer;)Z", false),
            ("removeConsumer", IMAGE_CONSUMER, false),
            ("requestTopDownLeftRightResend", IMAGE_CONSUMER, false),
            ("startProduction", IMAGE_CONSUMER, false),
        ],
    ),
    interface("java/awt/MenuContainer", &[], &[]),
    interface(
        "java/awt/event/KeyListener",
        &["java/util/EventListener"],
        &[
            ("keyPressed", KEY_EVENT, false),
            ("keyReleased", KEY_EVENT, false),
            ("keyTyped", KEY_EVENT, false),
        ],
    ),
    interface(
        "java/awt/event/MouseListener",
        &["java/util/EventListener"],
        &[
            ("mouseClicked", MOUSE_EVENT, false),
            ("mouseEntered", MOUSE_EVENT, false),
            ("mouseExited", MOUSE_EVENT, false),
            ("mousePressed", MOUSE_EVENT, false),
            ("mouseReleased", MOUSE_EVENT, false),
        ],
    ),
    interface(
        "java/awt/event/MouseMotionListener",
        &["java/util/EventListener"],
        &[
            ("mouseDragged", MOUSE_EVENT, false),
            ("mouseMoved", MOUSE_EVENT, false),
        ],
    ),
    interface(
        "java/awt/event/FocusListener",
        &["java/util/EventListener"],
        &[
            ("focusGained", FOCUS_EVENT, false),
            ("focusLost", FOCUS_EVENT, false),
        ],
    ),
    interface(
        "java/awt/event/WindowListener",
        &["java/util/EventListener"],
        &[
            ("windowActivated", WINDOW_EVENT, false),
            ("windowClosed", WINDOW_EVENT, false),
            ("windowClosing", WINDOW_EVENT, false),
            ("windowDeactivated", WINDOW_EVENT, false),
            ("windowDeiconified", WINDOW_EVENT, false),
            ("windowIconified", WINDOW_EVENT, false),
            ("windowOpened", WINDOW_EVENT, false),
        ],
    ),
    class(
        "java/awt/Component",
        OBJECT,
        &[
            "java/awt/image/ImageObserver",
            "java/awt/MenuContainer",
            "java/io/Serializable",
        ],
        &[
            ("paint", GRAPHICS, false),
            ("update", GRAPHICS, false),
            ("repaint", "()V", false),
            ("getGraphics", "()Ljava/awt/Graphics;", false),
        ],
    ),
    class(
        "java/awt/Canvas",
        "java/awt/Component",
        &[],
        &[("<init>", "()V", false), ("paint", GRAPHICS, false)],
    ),
    class(
        "java/awt/Container",
        "java/awt/Component",
        &[],
        &[("paint", GRAPHICS, false), ("update", GRAPHICS, false)],
    ),
    class("java/awt/Panel", "java/awt/Container", &[], &[("<init>", "()V", false)]),
    class("java/awt/Window", "java/awt/Container", &[], &[("dispose", "()V", false)]),
    class("java/awt/Frame", "java/awt/Window", &[], &[("<init>", "()V", false)]),
    class(
        "java/applet/Applet",
        "java/awt/Panel",
        &[],
        &[
            ("<init>", "()V", false),
            ("destroy", "()V", false),
            ("getAppletContext", "()Ljava/applet/AppletContext;", false),
            ("getCodeBase", "()Ljava/net/URL;", false),
            ("getDocumentBase", "()Ljava/net/URL;", false),
            ("getParameter", "(Ljava/lang/String;)Ljava/lang/String;", false),
            ("init", "()V", false),
            ("start", "()V", false),
            ("stop", "()V", false),
        ],
    ),
];

impl BuiltinClass {
    fn snapshot(&self) -> ExternalClass {
        let mut access = AccessFlags::PUBLIC;
        if self.interface {
            access |= AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        }
        ExternalClass {
            name: self.name.to_string(),
            super_name: self.super_name.map(str::to_string),
            interfaces: self.interfaces.iter().map(|name| name.to_string()).collect(),
            access,
            fields: Vec::new(),
            methods: self
                .methods
                .iter()
                .map(|(name, descriptor, native)| {
                    let mut access = AccessFlags::PUBLIC;
                    if *native {
                        access |= AccessFlags::NATIVE;
                    }
                    (MemberDesc::new(name, descriptor), access)
                })
                .collect(),
        }
    }
}

/// Last-resort metadata for platform classes.
pub(crate) struct RuntimeProvider {
    classes: BTreeMap<String, Arc<ExternalClass>>,
}

impl RuntimeProvider {
    pub(crate) fn builtin() -> Self {
        let classes = BUILTIN
            .iter()
            .map(|class| (class.name.to_string(), Arc::new(class.snapshot())))
            .collect();
        Self { classes }
    }

    /// Layer classes read from a runtime image over the built-in table.
    pub(crate) fn with_library(mut self, library: &Library) -> Self {
        for class in library.iter() {
            self.classes.insert(
                class.name.clone(),
                Arc::new(ExternalClass::from_class(class)),
            );
        }
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<ExternalClass>> {
        self.classes.get(name).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Class;

    #[test]
    fn builtin_supertypes_are_closed() {
        let runtime = RuntimeProvider::builtin();
        for class in BUILTIN {
            for name in class.super_name.iter().chain(class.interfaces) {
                assert!(runtime.get(name).is_some(), "{} references {name}", class.name);
            }
        }
    }

    #[test]
    fn native_methods_carry_the_flag() {
        let runtime = RuntimeProvider::builtin();
        let object = runtime.get(OBJECT).expect("object");
        let (_, access) = object
            .methods
            .iter()
            .find(|(desc, _)| desc.name == "getClass")
            .expect("getClass");
        assert!(access.contains(AccessFlags::NATIVE));
        let runnable = runtime.get("java/lang/Runnable").expect("runnable");
        assert!(runnable.access.contains(AccessFlags::INTERFACE));
    }

    #[test]
    fn runtime_library_extends_the_table() {
        let mut library = Library::new("rt");
        library.add(Class::new("java/util/Random", Some(OBJECT)));
        let runtime = RuntimeProvider::builtin().with_library(&library);
        assert!(runtime.get("java/util/Random").is_some());
        assert_eq!(runtime.len(), BUILTIN.len() + 1);
    }
}
