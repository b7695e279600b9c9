use crate::error::Result;
use crate::symbol::Identifier;

macro_rules! core_identifiers {
    ($($variant:ident => $text:literal),* $(,)?) => {
        /// Names of the identifiers every table interns permanently at creation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum CoreId {
            $($variant),*
        }

        impl CoreId {
            pub const ALL: &'static [CoreId] = &[$(CoreId::$variant),*];

            pub const fn text(self) -> &'static str {
                match self {
                    $(CoreId::$variant => $text),*
                }
            }
        }
    };
}

core_identifiers! {
    Empty => "",
    JavaLangObject => "java/lang/Object",
    JavaLangString => "java/lang/String",
    JavaLangClass => "java/lang/Class",
    JavaLangClassLoader => "java/lang/ClassLoader",
    JavaLangThrowable => "java/lang/Throwable",
    JavaLangSystem => "java/lang/System",
    JavaLangThread => "java/lang/Thread",
    Init => "<init>",
    Clinit => "<clinit>",
    Main => "main",
    VoidSignature => "()V",
    MainSignature => "([Ljava/lang/String;)V",
    Code => "Code",
    ConstantValue => "ConstantValue",
    Exceptions => "Exceptions",
    LineNumberTable => "LineNumberTable",
    LocalVariableTable => "LocalVariableTable",
    Signature => "Signature",
    SourceFile => "SourceFile",
    StackMapTable => "StackMapTable",
    InnerClasses => "InnerClasses",
}

/// Handles to the core vocabulary, indexed by [`CoreId`].
#[derive(Debug)]
pub struct CoreIdentifiers {
    ids: Box<[Identifier]>,
}

impl CoreIdentifiers {
    pub(crate) fn intern_with<F>(mut intern: F) -> Result<Self>
    where
        F: FnMut(&[u8]) -> Result<Identifier>,
    {
        let ids = CoreId::ALL
            .iter()
            .map(|id| intern(id.text().as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ids: ids.into_boxed_slice(),
        })
    }

    pub fn get(&self, id: CoreId) -> &Identifier {
        &self.ids[id as usize]
    }

    /// The core id whose row is `identifier`, if any.
    pub fn id_of(&self, identifier: &Identifier) -> Option<CoreId> {
        self.ids
            .iter()
            .position(|candidate| candidate == identifier)
            .map(|index| CoreId::ALL[index])
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CoreId, &Identifier)> {
        CoreId::ALL.iter().copied().zip(self.ids.iter())
    }
}
