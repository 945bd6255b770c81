// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

/// Declares a heap-pinned chain of vulkan structures, linked through their
/// `p_next` pointers in declaration order.
///
/// Profiles and capability queries are built once and then referenced by
/// every session, image, buffer and query pool created for a sequence, so
/// they need to outlive any single builder expression. Since the chain
/// points into itself, it's kept in a `Pin<Box<_>>`.
///
/// The generated type has:
///
///  - `new`, taking every member, and `Default`
///  - `AsRef` and `AsMut` for the head of the chain
///  - `with_<member>` for every member after the head, which replaces it
///    while keeping the links intact
///  - `Deref` to the inner struct, for reading members directly
macro_rules! vk_chain {
    (
        $(#[$meta:meta])*
        $vis:vis struct $Chain:ident <$lifetime:lifetime> {
            $(#[$head_meta:meta])*
            pub $HeadName:ident: $HeadStruct:ty,
            $(
                $(#[$field_meta:meta])*
                pub $Name:ident: $Struct:ty,
            )+
        }
    ) => {
        paste::paste! {
            $(#[$meta])*
            $vis struct [<$Chain Inner>] <$lifetime> {
                $(#[$head_meta])*
                pub $HeadName: $HeadStruct,
                $(
                    $(#[$field_meta])*
                    pub $Name: $Struct,
                )*
            }

            $vis struct $Chain(std::pin::Pin<Box<[<$Chain Inner>] <'static> >>);

            unsafe impl Send for $Chain {}
            unsafe impl Sync for $Chain {}

            #[allow(dead_code)]
            impl $Chain {
                pub fn new<$lifetime: 'static>($HeadName: $HeadStruct, $($Name: $Struct,)*) -> Self {
                    let mut ch = Box::pin([<$Chain Inner>] {
                        $HeadName,
                        $($Name,)*
                    });

                    __set_p_next!(ch, $HeadName, $($Name),*);
                    Self(ch)
                }

                $(
                    #[doc = "Replaces `" $Name "`, keeping the chain linked."]
                    pub fn [<with_ $Name>]<$lifetime: 'static, F>(&mut self, f: F)
                    where
                        F: FnOnce($Struct) -> $Struct,
                    {
                        let p_next = self.0.$Name.p_next;
                        self.0.$Name = f(self.$Name);
                        self.0.$Name.p_next = p_next;
                    }
                )*
            }

            impl Default for $Chain {
                fn default() -> Self {
                    Self::new(__replace_expr!($HeadStruct Default::default()), $(__replace_expr!($Struct Default::default()),)*)
                }
            }

            impl std::ops::Deref for $Chain {
                type Target = [<$Chain Inner>]<'static>;

                fn deref(&self) -> &Self::Target {
                    std::pin::Pin::deref(&self.0)
                }
            }
        }

        impl<$lifetime: 'static> AsRef<$HeadStruct> for $Chain {
            fn as_ref(&self) -> &$HeadStruct {
                &self.0.as_ref().get_ref().$HeadName
            }
        }

        impl<$lifetime: 'static> AsMut<$HeadStruct> for $Chain {
            fn as_mut(&mut self) -> &mut $HeadStruct {
                &mut self.0.as_mut().get_mut().$HeadName
            }
        }
    };
}

macro_rules! __set_p_next(
    ($target:ident, $head:ident, $next:ident) => {
        $target.$head.p_next = <*mut _>::cast(&mut $target.$next);
    };
    ($target:ident, $head:ident, $next:ident, $($tail:ident),+) => {
        $target.$head.p_next = <*mut _>::cast(&mut $target.$next);
        __set_p_next!($target, $next, $($tail),+);
    };
);

macro_rules! __replace_expr {
    ($_t:tt $sub:expr) => {
        $sub
    };
}

pub(crate) use __replace_expr;
pub(crate) use __set_p_next;
pub(crate) use vk_chain;

#[cfg(test)]
mod test {
    use ash::vk;

    vk_chain! {
        pub struct TestDecodeProfile<'a> {
            pub profile_info: vk::VideoProfileInfoKHR<'a>,
            pub usage_info: vk::VideoDecodeUsageInfoKHR<'a>,
            pub h265_profile: vk::VideoDecodeH265ProfileInfoKHR<'a>,
        }
    }

    #[test]
    fn links_in_order() {
        let chain = TestDecodeProfile::default();

        let head = chain.as_ref() as *const vk::VideoProfileInfoKHR;
        assert_eq!(
            chain.profile_info.p_next,
            &chain.usage_info as *const _ as *const std::ffi::c_void
        );
        assert_eq!(
            chain.usage_info.p_next,
            &chain.h265_profile as *const _ as *const std::ffi::c_void
        );
        assert!(chain.h265_profile.p_next.is_null());
        assert_eq!(head, &chain.profile_info as *const _);
    }

    #[test]
    fn replace_member() {
        let mut chain = TestDecodeProfile::new(
            vk::VideoProfileInfoKHR::default()
                .video_codec_operation(vk::VideoCodecOperationFlagsKHR::DECODE_H265),
            vk::VideoDecodeUsageInfoKHR::default(),
            vk::VideoDecodeH265ProfileInfoKHR::default(),
        );

        let p_next = chain.usage_info.p_next;
        chain.with_usage_info(|info| {
            info.video_usage_hints(vk::VideoDecodeUsageFlagsKHR::STREAMING)
        });

        assert_eq!(
            chain.usage_info.video_usage_hints,
            vk::VideoDecodeUsageFlagsKHR::STREAMING
        );
        assert_eq!(chain.usage_info.p_next, p_next);
        assert_eq!(
            chain.profile_info.video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::DECODE_H265
        );
    }
}
